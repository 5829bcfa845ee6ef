use crate::{error::LbrError, state_list::StateHandle};
use serde::Serialize;
use std::fmt;

bitflags! {
    /// MSR_LBR_SELECT. A set bit *suppresses* recording of that branch class.
    #[derive(Serialize)]
    #[serde(transparent)]
    pub struct LbrSelect: u64 {
        /// Branches ending in ring 0.
        const CPL_EQ_0 = 1 << 0;
        /// Branches ending in rings 1-3.
        const CPL_NEQ_0 = 1 << 1;
        const JCC = 1 << 2;
        const NEAR_REL_CALL = 1 << 3;
        const NEAR_IND_CALL = 1 << 4;
        const NEAR_RET = 1 << 5;
        const NEAR_IND_JMP = 1 << 6;
        const NEAR_REL_JMP = 1 << 7;
        const FAR_BRANCH = 1 << 8;
        /// Call stack mode (Haswell and later).
        const EN_CALLSTACK = 1 << 9;

        /// Used when ENABLE_TRACE passes no mask: every user space branch,
        /// nothing from the kernel.
        const DEFAULT = Self::CPL_EQ_0.bits;
    }
}

impl LbrSelect {
    /// Caller supplied masks are opaque: unknown bits go to hardware as is.
    pub fn from_raw(bits: u64) -> LbrSelect {
        // The struct only wraps a u64, so any value is representable.
        unsafe { LbrSelect::from_bits_unchecked(bits) }
    }
}

/// One from/to pair of the LBR stack.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Serialize)]
pub struct LbrStackEntry {
    pub from: u64,
    pub to: u64,
}

/// Per-process LBR configuration and the register contents saved when the
/// process was last switched out.
#[derive(Clone, Debug)]
pub struct LbrState {
    pub pid: u32,
    pub lbr_select: LbrSelect,
    pub lbr_tos: u64,
    entries: Box<[LbrStackEntry]>,
    pub parent: Option<StateHandle>,
}

impl LbrState {
    /// A zeroed state with `capacity` entries. Allocation failure is reported
    /// rather than aborting.
    pub fn new(pid: u32, lbr_select: LbrSelect, capacity: usize) -> Result<LbrState, LbrError> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|_| LbrError::NoMemory)?;
        entries.resize(capacity, LbrStackEntry::default());

        Ok(LbrState {
            pid,
            lbr_select,
            lbr_tos: 0,
            entries: entries.into_boxed_slice(),
            parent: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LbrStackEntry] {
        &self.entries
    }

    /// Never changes the length.
    pub fn entries_mut(&mut self) -> &mut [LbrStackEntry] {
        &mut self.entries
    }

    pub fn snapshot(&self, cpu: usize) -> LbrSnapshot {
        LbrSnapshot {
            pid: self.pid,
            cpu,
            lbr_select: self.lbr_select,
            lbr_tos: self.lbr_tos,
            entries: self.entries.to_vec(),
        }
    }
}

/// What DUMP_LBR hands back.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LbrSnapshot {
    pub pid: u32,
    pub cpu: usize,
    pub lbr_select: LbrSelect,
    pub lbr_tos: u64,
    pub entries: Vec<LbrStackEntry>,
}

impl fmt::Display for LbrSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PROC_PID:             {}", self.pid)?;
        writeln!(f, "MSR_LBR_SELECT:       {:#x}", self.lbr_select.bits())?;
        writeln!(f, "MSR_LBR_TOS:          {}", self.lbr_tos)?;
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(f, "MSR_LBR_NHM_FROM[{:2}]: {:#x}", i, entry.from)?;
            writeln!(f, "MSR_LBR_NHM_TO  [{:2}]: {:#x}", i, entry.to)?;
        }
        write!(f, "LBR info for cpu: {}", self.cpu)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_state_is_zeroed() {
        let state = LbrState::new(42, LbrSelect::DEFAULT, 16).unwrap();
        assert_eq!(16, state.capacity());
        assert_eq!(0, state.lbr_tos);
        assert!(state.parent.is_none());
        assert!(state.entries().iter().all(|e| *e == LbrStackEntry::default()));
    }

    #[test]
    fn opaque_select_bits_survive() {
        let select = LbrSelect::from_raw(0x8000_0000_0000_0003);
        assert_eq!(0x8000_0000_0000_0003, select.bits());
        assert!(select.contains(LbrSelect::CPL_EQ_0 | LbrSelect::CPL_NEQ_0));
    }

    #[test]
    fn huge_capacity_is_no_memory() {
        match LbrState::new(1, LbrSelect::DEFAULT, usize::MAX) {
            Err(LbrError::NoMemory) => (),
            other => panic!("unexpected {:?}", other.map(|s| s.pid)),
        }
    }

    #[test]
    fn snapshot_display() {
        let mut state = LbrState::new(7, LbrSelect::from_raw(0xf), 2).unwrap();
        state.lbr_tos = 1;
        state.entries_mut()[1] = LbrStackEntry {
            from: 0x401000,
            to: 0x402000,
        };
        let text = state.snapshot(3).to_string();
        assert!(text.contains("PROC_PID:             7"));
        assert!(text.contains("MSR_LBR_SELECT:       0xf"));
        assert!(text.contains("MSR_LBR_NHM_FROM[ 1]: 0x401000"));
        assert!(text.ends_with("LBR info for cpu: 3"));
    }

    #[test]
    fn snapshot_serializes_select_as_number() {
        let state = LbrState::new(7, LbrSelect::from_raw(0xf), 1).unwrap();
        let json = serde_json::to_value(state.snapshot(0)).unwrap();
        assert_eq!(0xf, json["lbr_select"].as_u64().unwrap());
        assert_eq!(1, json["entries"].as_array().unwrap().len());
    }
}
