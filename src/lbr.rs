//! Moving the LBR stack between the hardware and `LbrState`.

use crate::{
    cpu::CpuPin,
    lbr_state::{LbrSelect, LbrState},
    log::LogLevel::*,
    msr::*,
};
use std::{io, sync::Arc};

/// Fixed for the whole session once the cpu has been identified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LbrConfig {
    pub capacity: usize,
    pub default_select: LbrSelect,
}

impl LbrConfig {
    pub fn new(capacity: usize) -> LbrConfig {
        LbrConfig {
            capacity,
            default_select: LbrSelect::DEFAULT,
        }
    }
}

/// LBR register access for the cpu the caller is pinned to. Every method
/// takes the `CpuPin` as proof; none of them pin by themselves.
#[derive(Clone)]
pub struct Lbr {
    msrs: Arc<dyn MsrBank>,
    capacity: usize,
}

impl Lbr {
    pub fn new(msrs: Arc<dyn MsrBank>, capacity: usize) -> Lbr {
        Lbr { msrs, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Zero the select, tos and every from/to pair, then switch LBR recording
    /// on or off in DEBUGCTL.
    pub fn flush(&self, pin: &CpuPin, enable: bool) -> io::Result<()> {
        let cpu = pin.cpu();
        self.msrs.wrmsr(cpu, MSR_LBR_SELECT, 0)?;
        self.msrs.wrmsr(cpu, MSR_LBR_TOS, 0)?;

        for i in 0..self.capacity as u32 {
            self.msrs.wrmsr(cpu, MSR_LBR_NHM_FROM + i, 0)?;
            self.msrs.wrmsr(cpu, MSR_LBR_NHM_TO + i, 0)?;
        }

        let debugctl = if enable { DEBUGCTLMSR_LBR } else { 0 };
        self.msrs.wrmsr(cpu, MSR_IA32_DEBUGCTLMSR, debugctl)
    }

    /// Save the hardware stack into `state`.
    pub fn read_into(&self, pin: &CpuPin, state: &mut LbrState) -> io::Result<()> {
        let cpu = pin.cpu();
        state.lbr_select = LbrSelect::from_raw(self.msrs.rdmsr(cpu, MSR_LBR_SELECT)?);
        state.lbr_tos = self.msrs.rdmsr(cpu, MSR_LBR_TOS)?;

        for (i, entry) in (0u32..).zip(state.entries_mut().iter_mut()) {
            entry.from = self.msrs.rdmsr(cpu, MSR_LBR_NHM_FROM + i)?;
            entry.to = self.msrs.rdmsr(cpu, MSR_LBR_NHM_TO + i)?;
        }
        Ok(())
    }

    /// Restore the hardware stack from `state`.
    pub fn write_from(&self, pin: &CpuPin, state: &LbrState) -> io::Result<()> {
        let cpu = pin.cpu();
        self.msrs.wrmsr(cpu, MSR_LBR_SELECT, state.lbr_select.bits())?;
        self.msrs.wrmsr(cpu, MSR_LBR_TOS, state.lbr_tos)?;

        for (i, entry) in (0u32..).zip(state.entries().iter()) {
            self.msrs.wrmsr(cpu, MSR_LBR_NHM_FROM + i, entry.from)?;
            self.msrs.wrmsr(cpu, MSR_LBR_NHM_TO + i, entry.to)?;
        }
        Ok(())
    }

    /// Flush the stack and turn recording on. No select filter is set yet.
    pub fn enable(&self, pin: &CpuPin) -> io::Result<()> {
        log!(LogDebug, "Enable LBR on cpu core: {}...", pin.cpu());
        self.flush(pin, true)
    }

    pub fn disable(&self, pin: &CpuPin) -> io::Result<()> {
        log!(LogDebug, "Disable LBR on cpu core: {}...", pin.cpu());
        // Remove the filter first
        self.msrs.wrmsr(pin.cpu(), MSR_LBR_SELECT, 0)?;
        self.flush(pin, false)
    }

    pub fn is_enabled(&self, pin: &CpuPin) -> io::Result<bool> {
        let debugctl = self.msrs.rdmsr(pin.cpu(), MSR_IA32_DEBUGCTLMSR)?;
        Ok(debugctl & DEBUGCTLMSR_LBR != 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lbr_state::LbrStackEntry;

    fn lbr(capacity: usize) -> (Arc<SoftMsrBank>, Lbr) {
        let bank = Arc::new(SoftMsrBank::new(1));
        let lbr = Lbr::new(bank.clone(), capacity);
        (bank, lbr)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_, lbr) = lbr(4);
        let pin = CpuPin::current().unwrap();
        let mut state = LbrState::new(1, LbrSelect::from_raw(0x3), 4).unwrap();
        state.lbr_tos = 2;
        for (i, e) in state.entries_mut().iter_mut().enumerate() {
            *e = LbrStackEntry {
                from: 0x1000 + i as u64,
                to: 0x2000 + i as u64,
            };
        }
        lbr.write_from(&pin, &state).unwrap();

        let mut copy = LbrState::new(1, LbrSelect::empty(), 4).unwrap();
        lbr.read_into(&pin, &mut copy).unwrap();
        assert_eq!(state.lbr_select, copy.lbr_select);
        assert_eq!(2, copy.lbr_tos);
        assert_eq!(state.entries(), copy.entries());
    }

    #[test]
    fn flush_clears_and_toggles_debugctl() {
        let (bank, lbr) = lbr(2);
        let pin = CpuPin::current().unwrap();
        bank.wrmsr(0, MSR_LBR_SELECT, 0xff).unwrap();
        bank.wrmsr(0, MSR_LBR_NHM_FROM + 1, 0xdead).unwrap();
        bank.wrmsr(0, MSR_LBR_NHM_TO + 1, 0xbeef).unwrap();

        lbr.enable(&pin).unwrap();
        assert!(lbr.is_enabled(&pin).unwrap());
        assert_eq!(0, bank.rdmsr(0, MSR_LBR_SELECT).unwrap());
        assert_eq!(0, bank.rdmsr(0, MSR_LBR_NHM_FROM + 1).unwrap());
        assert_eq!(0, bank.rdmsr(0, MSR_LBR_NHM_TO + 1).unwrap());

        lbr.disable(&pin).unwrap();
        assert!(!lbr.is_enabled(&pin).unwrap());
    }

    #[test]
    fn only_capacity_pairs_are_touched() {
        let (bank, lbr) = lbr(2);
        let pin = CpuPin::current().unwrap();
        bank.wrmsr(0, MSR_LBR_NHM_FROM + 2, 0x77).unwrap();
        lbr.flush(&pin, true).unwrap();
        assert_eq!(0x77, bank.rdmsr(0, MSR_LBR_NHM_FROM + 2).unwrap());
    }
}
