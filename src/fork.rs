//! Children of traced processes are traced too.

use crate::{
    error::LbrResult, host::SyscallHook, lbr_state::LbrState, log::LogLevel::*,
    state_list::StateHandle, tracer::LbrTracer,
};

/// The syscall the fork hook hangs off.
pub const FORK_SYMBOL: &str = "kernel_clone";

impl LbrTracer {
    /// `parent` has just created `child`. If the parent is traced, the child
    /// gets its own state with the parent's select bits, linked to the
    /// parent so that disabling the parent takes the child with it.
    ///
    /// Returns the new state, or `None` if nothing had to be done.
    pub fn fork_child(&self, parent: u32, child: u32) -> LbrResult<Option<StateHandle>> {
        // Every fork in the system comes through here.
        if !self.is_traced(parent) {
            return Ok(None);
        }

        // Allocate outside the lock, then look again.
        let mut child_state =
            LbrState::new(child, self.config().default_select, self.config().capacity)?;

        let mut states = self.states();
        let parent_handle = match states.find(parent) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        if states.find(child).is_some() {
            drop(states);
            log!(LogDebug, "Child {} of {} is already traced", child, parent);
            return Ok(None);
        }

        if let Some(parent_state) = states.get(parent_handle) {
            child_state.lbr_select = parent_state.lbr_select;
        }
        child_state.parent = Some(parent_handle);
        let handle = states.insert(child_state)?;
        drop(states);

        log!(LogDebug, "New child {} of parent {} is inserted", child, parent);
        Ok(Some(handle))
    }
}

impl SyscallHook for LbrTracer {
    fn pre_handler(&self, pid: u32) {
        log!(LogDebug, "Fork pre handler for pid {}.", pid);
    }

    fn post_handler(&self, pid: u32, child: Option<u32>) {
        let child = match child {
            Some(child) => child,
            None => return,
        };
        if let Err(e) = self.fork_child(pid, child) {
            log!(LogWarn, "Could not trace child {} of {}: {}", child, pid, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{lbr::LbrConfig, lbr_state::LbrSelect, msr::SoftMsrBank};
    use std::sync::Arc;

    fn tracer() -> LbrTracer {
        LbrTracer::new(Arc::new(SoftMsrBank::new(1)), LbrConfig::new(4))
    }

    fn trace(tracer: &LbrTracer, pid: u32, select: u64) -> StateHandle {
        let state = LbrState::new(pid, LbrSelect::from_raw(select), 4).unwrap();
        tracer.states().insert(state).unwrap()
    }

    #[test]
    fn child_inherits_select_and_parent() {
        let tracer = tracer();
        let parent = trace(&tracer, 10, 0x1f);
        let child = tracer.fork_child(10, 11).unwrap().unwrap();

        let states = tracer.states();
        let state = states.get(child).unwrap();
        assert_eq!(11, state.pid);
        assert_eq!(0x1f, state.lbr_select.bits());
        assert_eq!(Some(parent), state.parent);
        assert_eq!(4, state.capacity());
    }

    #[test]
    fn untraced_parent_is_ignored() {
        let tracer = tracer();
        trace(&tracer, 10, 0);
        assert_eq!(None, tracer.fork_child(20, 21).unwrap());
        assert_eq!(1, tracer.nr_traced());
    }

    #[test]
    fn already_traced_child_is_left_alone() {
        let tracer = tracer();
        trace(&tracer, 10, 0x1);
        trace(&tracer, 11, 0x2);
        assert_eq!(None, tracer.fork_child(10, 11).unwrap());
        assert_eq!(2, tracer.nr_traced());
        assert_eq!(None, tracer.states().find_state(11).unwrap().parent);
    }

    #[test]
    fn pre_handler_leaves_states_alone() {
        let tracer = tracer();
        trace(&tracer, 10, 0x1);
        tracer.pre_handler(10);
        tracer.pre_handler(99);
        assert_eq!(vec![10], tracer.traced_pids());
    }

    #[test]
    fn fork_hooks_and_disable_take_the_family_down() {
        let tracer = tracer();
        let root = trace(&tracer, 10, 0x1);
        tracer.pre_handler(10);
        tracer.post_handler(10, Some(11));
        tracer.post_handler(11, Some(12));
        tracer.post_handler(10, None);
        assert_eq!(vec![10, 12, 11], tracer.traced_pids());

        assert_eq!(3, tracer.states().remove(root).unwrap());
        assert_eq!(0, tracer.nr_traced());
    }
}
