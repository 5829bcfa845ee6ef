//! Save and restore the LBR stack during context switches.
//!
//! This runs on every preemption in the system, so untraced processes must
//! cost no more than a lookup, and nothing here may fail loudly.

use crate::{cpu::CpuPin, host::PreemptNotifier, log::LogLevel::*, tracer::LbrTracer};
use std::io;

impl LbrTracer {
    fn pin_for(&self, what: &str, pid: u32) -> Option<CpuPin> {
        match CpuPin::current() {
            Ok(pin) => Some(pin),
            Err(e) => {
                log!(LogWarn, "Could not pin cpu to {} pid {}: {}", what, pid, e);
                None
            }
        }
    }

    fn report(&self, what: &str, pid: u32, res: io::Result<()>) {
        if let Err(e) = res {
            log!(LogWarn, "Could not {} LBR for pid {}: {}", what, pid, e);
        }
    }

    /// `pid` is being switched out: save its stack.
    pub fn save_lbr(&self, pid: u32) {
        // Cheap check first; untraced processes should not pay for pinning.
        if !self.is_traced(pid) {
            return;
        }

        log!(LogDebug, "Leave, saving LBR status for pid: {}", pid);
        let pin = match self.pin_for("save", pid) {
            Some(pin) => pin,
            None => return,
        };
        let mut states = self.states();
        // Tracing may have been disabled since the check above.
        let res = match states.find_state_mut(pid) {
            Some(state) => self.lbr().read_into(&pin, state),
            None => Ok(()),
        };
        drop(states);
        self.report("save", pid, res);
    }

    /// `pid` is being switched in: put its stack back.
    pub fn restore_lbr(&self, pid: u32) {
        if !self.is_traced(pid) {
            return;
        }

        log!(LogDebug, "Enter, restoring LBR status for pid: {}", pid);
        let pin = match self.pin_for("restore", pid) {
            Some(pin) => pin,
            None => return,
        };
        let states = self.states();
        let res = match states.find_state(pid) {
            Some(state) => self.lbr().write_from(&pin, state),
            None => Ok(()),
        };
        drop(states);
        self.report("restore", pid, res);
    }
}

impl PreemptNotifier for LbrTracer {
    fn sched_in(&self, pid: u32, _cpu: usize) {
        self.restore_lbr(pid);
    }

    fn sched_out(&self, pid: u32, _next: u32) {
        self.save_lbr(pid);
    }
}
