//! The control plane: ioctl requests against the LBR registry.

use crate::{
    cpu::CpuPin,
    error::{LbrError, LbrResult},
    host::ControlDevice,
    lbr_state::{LbrSelect, LbrSnapshot, LbrState},
    log::LogLevel::*,
    state_list::StateHandle,
    tracer::LbrTracer,
};
use std::mem::size_of;

/// What user space hands us with every ioctl.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IoctlRequest {
    pub lbr_select: u64,
    pub pid: u32,
}

assert_eq_size!(IoctlRequest, [u8; 16]);

pub const IOCTL_REQUEST_SIZE: usize = size_of::<IoctlRequest>();

impl IoctlRequest {
    /// The buffer must be exactly one request long; we never act on a
    /// partial copy or guess at trailing bytes.
    pub fn from_bytes(buf: &[u8]) -> LbrResult<IoctlRequest> {
        if buf.len() != IOCTL_REQUEST_SIZE {
            return Err(LbrError::PartialRequest {
                expected: IOCTL_REQUEST_SIZE,
                got: buf.len(),
            });
        }

        let select_at = offset_of!(IoctlRequest, lbr_select);
        let pid_at = offset_of!(IoctlRequest, pid);
        let mut lbr_select = [0u8; 8];
        lbr_select.copy_from_slice(&buf[select_at..select_at + 8]);
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[pid_at..pid_at + 4]);
        Ok(IoctlRequest {
            lbr_select: u64::from_ne_bytes(lbr_select),
            pid: u32::from_ne_bytes(pid),
        })
    }

    pub fn to_bytes(&self) -> [u8; IOCTL_REQUEST_SIZE] {
        let mut buf = [0u8; IOCTL_REQUEST_SIZE];
        let select_at = offset_of!(IoctlRequest, lbr_select);
        let pid_at = offset_of!(IoctlRequest, pid);
        buf[select_at..select_at + 8].copy_from_slice(&self.lbr_select.to_ne_bytes());
        buf[pid_at..pid_at + 4].copy_from_slice(&self.pid.to_ne_bytes());
        buf
    }
}

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_WRITE: u32 = 1;

/// _IOW(ty, nr, size) from <asm-generic/ioctl.h>.
const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    (IOC_WRITE << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

pub const LIBIHT_IOC_MAGIC: u8 = b'l';
pub const LIBIHT_IOC_ENABLE_TRACE: u32 = iow(LIBIHT_IOC_MAGIC, 1, IOCTL_REQUEST_SIZE);
pub const LIBIHT_IOC_DISABLE_TRACE: u32 = iow(LIBIHT_IOC_MAGIC, 2, IOCTL_REQUEST_SIZE);
pub const LIBIHT_IOC_DUMP_LBR: u32 = iow(LIBIHT_IOC_MAGIC, 3, IOCTL_REQUEST_SIZE);
pub const LIBIHT_IOC_SELECT_LBR: u32 = iow(LIBIHT_IOC_MAGIC, 4, IOCTL_REQUEST_SIZE);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LbrCommand {
    EnableTrace,
    DisableTrace,
    DumpLbr,
    SelectLbr,
}

impl LbrCommand {
    pub fn from_raw(cmd: u32) -> LbrResult<LbrCommand> {
        match cmd {
            LIBIHT_IOC_ENABLE_TRACE => Ok(LbrCommand::EnableTrace),
            LIBIHT_IOC_DISABLE_TRACE => Ok(LbrCommand::DisableTrace),
            LIBIHT_IOC_DUMP_LBR => Ok(LbrCommand::DumpLbr),
            LIBIHT_IOC_SELECT_LBR => Ok(LbrCommand::SelectLbr),
            _ => Err(LbrError::BadCommand(cmd)),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            LbrCommand::EnableTrace => LIBIHT_IOC_ENABLE_TRACE,
            LbrCommand::DisableTrace => LIBIHT_IOC_DISABLE_TRACE,
            LbrCommand::DumpLbr => LIBIHT_IOC_DUMP_LBR,
            LbrCommand::SelectLbr => LIBIHT_IOC_SELECT_LBR,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IoctlReply {
    Enabled(u32),
    /// How many states went away (the target and its descendants).
    Disabled(usize),
    Dumped(LbrSnapshot),
    Selected(u32),
}

impl LbrTracer {
    /// Start tracing `pid`. `select` 0 means the configured default.
    pub fn enable_trace(&self, pid: u32, select: u64) -> LbrResult<StateHandle> {
        let select = if select == 0 {
            self.config().default_select
        } else {
            LbrSelect::from_raw(select)
        };
        let state = LbrState::new(pid, select, self.config().capacity)?;

        let pin = CpuPin::current()?;
        let mut states = self.states();
        if states.find(pid).is_some() {
            return Err(LbrError::AlreadyTraced(pid));
        }
        let handle = states.insert(state)?;

        let loaded = match states.get(handle) {
            Some(state) => self.lbr().write_from(&pin, state),
            None => Ok(()),
        };
        if let Err(e) = loaded {
            // Leave nothing behind.
            states.remove(handle)?;
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Stop tracing `pid` and everything it forked while traced.
    pub fn disable_trace(&self, pid: u32) -> LbrResult<usize> {
        let mut states = self.states();
        let handle = states.find(pid).ok_or(LbrError::NotFound(pid))?;
        states.remove(handle)
    }

    /// Refresh the state of `pid` (or of the head of the list if `None`) from
    /// the hardware and hand back a copy.
    pub fn dump_lbr(&self, pid: Option<u32>) -> LbrResult<LbrSnapshot> {
        let pin = CpuPin::current()?;
        let mut states = self.states();
        let handle = match pid {
            Some(pid) => states.find(pid),
            None => states.head(),
        }
        .ok_or(LbrError::NotFound(pid.unwrap_or(0)))?;

        let snapshot = match states.get_mut(handle) {
            Some(state) => {
                self.lbr().read_into(&pin, state)?;
                state.snapshot(pin.cpu())
            }
            None => return Err(LbrError::StaleHandle),
        };
        drop(states);

        log!(LogInfo, "\n{}", snapshot);
        Ok(snapshot)
    }

    /// New select bits for `pid`, pushed to the hardware straight away.
    pub fn select_lbr(&self, pid: u32, select: u64) -> LbrResult<()> {
        let pin = CpuPin::current()?;
        let mut states = self.states();
        let state = states.find_state_mut(pid).ok_or(LbrError::NotFound(pid))?;
        state.lbr_select = LbrSelect::from_raw(select);
        self.lbr().write_from(&pin, state)?;
        Ok(())
    }

    /// Decode and run one request. A pid of 0 means the caller, except for
    /// DUMP_LBR where it means the head of the list. SELECT_LBR takes its new
    /// select bits from `ioctl_param`.
    pub fn dispatch(
        &self,
        caller: u32,
        cmd: u32,
        request: &[u8],
        ioctl_param: u64,
    ) -> LbrResult<IoctlReply> {
        let request = IoctlRequest::from_bytes(request)?;
        log!(
            LogDebug,
            "ioctl {:#x}: select bits {:#x}, pid {}",
            cmd,
            request.lbr_select,
            request.pid
        );
        let target = if request.pid != 0 { request.pid } else { caller };

        match LbrCommand::from_raw(cmd)? {
            LbrCommand::EnableTrace => {
                self.enable_trace(target, request.lbr_select)?;
                Ok(IoctlReply::Enabled(target))
            }
            LbrCommand::DisableTrace => Ok(IoctlReply::Disabled(self.disable_trace(target)?)),
            LbrCommand::DumpLbr => {
                let pid = if request.pid != 0 {
                    Some(request.pid)
                } else {
                    None
                };
                Ok(IoctlReply::Dumped(self.dump_lbr(pid)?))
            }
            LbrCommand::SelectLbr => {
                self.select_lbr(target, ioctl_param)?;
                Ok(IoctlReply::Selected(target))
            }
        }
    }
}

impl ControlDevice for LbrTracer {
    fn device_open(&self) -> i64 {
        log!(LogDebug, "Device opened.");
        0
    }

    fn device_release(&self) -> i64 {
        log!(LogDebug, "Device closed.");
        0
    }

    /// Reading dumps the head of the list to the log; no bytes are returned.
    fn device_read(&self, _caller: u32, _buf: &mut [u8]) -> i64 {
        log!(LogDebug, "Device read.");
        if let Err(e) = self.dump_lbr(None) {
            log!(LogDebug, "Nothing to dump: {}", e);
        }
        0
    }

    fn device_write(&self, _caller: u32, _buf: &[u8]) -> i64 {
        log!(LogDebug, "Device write.");
        0
    }

    fn device_ioctl(&self, caller: u32, cmd: u32, request: &[u8], ioctl_param: u64) -> i64 {
        match self.dispatch(caller, cmd, request, ioctl_param) {
            Ok(_) => 0,
            Err(e) => {
                log!(LogInfo, "ioctl {:#x} rejected: {}", cmd, e);
                e.status()
            }
        }
    }
}
