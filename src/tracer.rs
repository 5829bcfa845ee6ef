use crate::{
    irq_lock::{IrqSpinLock, IrqSpinLockGuard},
    lbr::{Lbr, LbrConfig},
    log::LogLevel::*,
    msr::MsrBank,
    state_list::StateList,
};
use std::sync::Arc;

/// The per-process LBR registry plus the hardware it saves and restores.
///
/// The context switch hooks (`context_switch`), the fork hook (`fork`) and
/// the control device (`ioctl`) are all implemented on this type. Every one
/// of them goes through `states`: the list and the LBR registers are only
/// touched with that lock held.
pub struct LbrTracer {
    config: LbrConfig,
    lbr: Lbr,
    states: IrqSpinLock<StateList>,
}

impl LbrTracer {
    pub fn new(msrs: Arc<dyn MsrBank>, config: LbrConfig) -> LbrTracer {
        LbrTracer {
            config,
            lbr: Lbr::new(msrs, config.capacity),
            states: IrqSpinLock::new(StateList::new()),
        }
    }

    pub fn config(&self) -> &LbrConfig {
        &self.config
    }

    pub fn lbr(&self) -> &Lbr {
        &self.lbr
    }

    pub(crate) fn states(&self) -> IrqSpinLockGuard<'_, StateList> {
        self.states.lock()
    }

    pub fn nr_traced(&self) -> usize {
        self.states().len()
    }

    pub fn is_traced(&self, pid: u32) -> bool {
        self.states().find(pid).is_some()
    }

    /// Pids in the order lookups visit them.
    pub fn traced_pids(&self) -> Vec<u32> {
        self.states().iter_rev().map(|(_, s)| s.pid).collect()
    }

    /// Throw every state away without cascading. For module exit.
    pub fn drain(&self) -> usize {
        let drained = self.states().drain_all();
        log!(LogDebug, "Freed {} LBR states", drained);
        drained
    }
}
