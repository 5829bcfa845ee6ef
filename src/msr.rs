//! Model specific register access.
//!
//! The LBR registers are per core, so every access names the cpu it is meant
//! for. Callers are expected to be pinned to that cpu (see `cpu::CpuPin`).

use crate::{log::LogLevel::*, scoped_fd::ScopedFd};
use nix::fcntl::OFlag;
use std::{
    collections::HashMap,
    ffi::c_void,
    io,
    path::Path,
    sync::Mutex,
};

pub const MSR_IA32_DEBUGCTLMSR: u32 = 0x1d9;
pub const DEBUGCTLMSR_LBR: u64 = 1 << 0;

pub const MSR_LBR_SELECT: u32 = 0x1c8;
pub const MSR_LBR_TOS: u32 = 0x1c9;
pub const MSR_LBR_NHM_FROM: u32 = 0x680;
pub const MSR_LBR_NHM_TO: u32 = 0x6c0;

pub trait MsrBank: Send + Sync {
    fn rdmsr(&self, cpu: usize, msr: u32) -> io::Result<u64>;
    fn wrmsr(&self, cpu: usize, msr: u32, val: u64) -> io::Result<()>;
}

/// The Linux msr driver: 8 byte reads and writes at offset `msr` of
/// `<root>/<cpu>/msr`.
pub struct MsrDevice {
    fds: Vec<ScopedFd>,
}

impl MsrDevice {
    /// Open the msr node of every configured cpu. Cpus whose node cannot be
    /// opened (e.g. offline) are remembered as closed and fail on access.
    pub fn open(root: &Path) -> io::Result<MsrDevice> {
        let nr_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if nr_cpus <= 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = Vec::with_capacity(nr_cpus as usize);
        let mut first_err = None;
        for cpu in 0..nr_cpus as usize {
            let path = root.join(cpu.to_string()).join("msr");
            match ScopedFd::open_path(&path, OFlag::O_RDWR | OFlag::O_CLOEXEC) {
                Ok(fd) => fds.push(fd),
                Err(e) => {
                    log!(LogWarn, "Could not open {:?}: {}", path, e);
                    first_err.get_or_insert(e);
                    fds.push(ScopedFd::new());
                }
            }
        }

        if fds.iter().all(|fd| !fd.is_open()) {
            // Typically: not root, or the msr module is not loaded.
            return Err(first_err.unwrap_or_else(|| io::Error::from_raw_os_error(libc::ENODEV)));
        }

        Ok(MsrDevice { fds })
    }

    fn fd(&self, cpu: usize) -> io::Result<&ScopedFd> {
        match self.fds.get(cpu) {
            Some(fd) if fd.is_open() => Ok(fd),
            _ => Err(io::Error::from_raw_os_error(libc::ENXIO)),
        }
    }
}

impl MsrBank for MsrDevice {
    fn rdmsr(&self, cpu: usize, msr: u32) -> io::Result<u64> {
        let fd = self.fd(cpu)?;
        let mut buf = [0u8; 8];
        let ret = unsafe {
            libc::pread64(
                fd.as_raw(),
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                msr as i64,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read of msr {:#x} on cpu {}", msr, cpu),
            ));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    fn wrmsr(&self, cpu: usize, msr: u32, val: u64) -> io::Result<()> {
        let fd = self.fd(cpu)?;
        let buf = val.to_ne_bytes();
        let ret = unsafe {
            libc::pwrite64(
                fd.as_raw(),
                buf.as_ptr().cast::<c_void>(),
                buf.len(),
                msr as i64,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write of msr {:#x} on cpu {}", msr, cpu),
            ));
        }
        Ok(())
    }
}

/// A software register file. Registers that were never written read as 0.
///
/// Cpu numbers are folded modulo `nr_cpus`, so `SoftMsrBank::new(1)` behaves
/// like a uniprocessor no matter where the caller happens to run.
pub struct SoftMsrBank {
    nr_cpus: usize,
    regs: Mutex<HashMap<(usize, u32), u64>>,
}

impl SoftMsrBank {
    pub fn new(nr_cpus: usize) -> SoftMsrBank {
        SoftMsrBank {
            nr_cpus: nr_cpus.max(1),
            regs: Mutex::new(HashMap::new()),
        }
    }

    fn regs(&self) -> std::sync::MutexGuard<'_, HashMap<(usize, u32), u64>> {
        match self.regs.lock() {
            Ok(regs) => regs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MsrBank for SoftMsrBank {
    fn rdmsr(&self, cpu: usize, msr: u32) -> io::Result<u64> {
        let cpu = cpu % self.nr_cpus;
        Ok(self.regs().get(&(cpu, msr)).copied().unwrap_or(0))
    }

    fn wrmsr(&self, cpu: usize, msr: u32, val: u64) -> io::Result<()> {
        let cpu = cpu % self.nr_cpus;
        self.regs().insert((cpu, msr), val);
        Ok(())
    }
}
