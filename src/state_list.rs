//! The registry of traced processes.
//!
//! States live in an arena and are threaded onto one circular doubly-linked
//! list through slot indices. `head` is the anchor: new states go in just
//! before it (the logical tail) and lookups walk backwards from it, so the
//! most recently added states are found first. Handles carry a generation so
//! a handle to a removed state can never alias a newer one in the same slot.

use crate::{error::LbrError, lbr_state::LbrState, log::LogLevel::*};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StateHandle {
    index: u32,
    generation: u32,
}

struct Node {
    state: LbrState,
    prev: usize,
    next: usize,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

pub struct StateList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    len: usize,
}

impl StateList {
    pub fn new() -> StateList {
        StateList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn node(&self, index: usize) -> &Node {
        match &self.slots[index].node {
            Some(node) => node,
            None => fatal!("Slot {} is linked but holds no state", index),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        match &mut self.slots[index].node {
            Some(node) => node,
            None => fatal!("Slot {} is linked but holds no state", index),
        }
    }

    fn handle_of(&self, index: usize) -> StateHandle {
        StateHandle {
            index: index as u32,
            generation: self.slots[index].generation,
        }
    }

    fn live_index(&self, handle: StateHandle) -> Option<usize> {
        let index = handle.index as usize;
        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation && slot.node.is_some() => {
                Some(index)
            }
            _ => None,
        }
    }

    /// The anchor state, if any.
    pub fn head(&self) -> Option<StateHandle> {
        self.head.map(|index| self.handle_of(index))
    }

    pub fn contains(&self, handle: StateHandle) -> bool {
        self.live_index(handle).is_some()
    }

    pub fn get(&self, handle: StateHandle) -> Option<&LbrState> {
        let index = self.live_index(handle)?;
        Some(&self.node(index).state)
    }

    pub fn get_mut(&mut self, handle: StateHandle) -> Option<&mut LbrState> {
        let index = self.live_index(handle)?;
        Some(&mut self.node_mut(index).state)
    }

    /// Grab a slot for `node`. Fails, leaving the list untouched, if the arena
    /// cannot grow.
    fn alloc_slot(&mut self, node: Node) -> Result<usize, LbrError> {
        if let Some(index) = self.free.pop() {
            self.slots[index].node = Some(node);
            return Ok(index);
        }

        if self.slots.len() >= u32::MAX as usize {
            return Err(LbrError::NoMemory);
        }
        self.slots.try_reserve(1).map_err(|_| LbrError::NoMemory)?;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        Ok(self.slots.len() - 1)
    }

    /// Append `state` at the tail of the list, i.e. just before the head.
    pub fn insert(&mut self, state: LbrState) -> Result<StateHandle, LbrError> {
        let pid = state.pid;
        let node = Node {
            state,
            prev: 0,
            next: 0,
        };
        let index = self.alloc_slot(node)?;

        match self.head {
            None => {
                let node = self.node_mut(index);
                node.prev = index;
                node.next = index;
                self.head = Some(index);
            }
            Some(head) => {
                let tail = self.node(head).prev;
                self.node_mut(tail).next = index;
                {
                    let node = self.node_mut(index);
                    node.prev = tail;
                    node.next = head;
                }
                self.node_mut(head).prev = index;
            }
        }
        self.len += 1;

        log!(LogDebug, "Inserted LBR state for pid {} (slot {})", pid, index);
        Ok(self.handle_of(index))
    }

    /// Backward traversal from the head: recently added states are the most
    /// likely to be asked for.
    pub fn find(&self, pid: u32) -> Option<StateHandle> {
        let head = self.head?;
        let mut cur = head;
        loop {
            let node = self.node(cur);
            if node.state.pid == pid {
                return Some(self.handle_of(cur));
            }
            cur = node.prev;
            if cur == head {
                return None;
            }
        }
    }

    pub fn find_state(&self, pid: u32) -> Option<&LbrState> {
        let handle = self.find(pid)?;
        self.get(handle)
    }

    pub fn find_state_mut(&mut self, pid: u32) -> Option<&mut LbrState> {
        let handle = self.find(pid)?;
        self.get_mut(handle)
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        if self.head == Some(index) {
            self.head = if next == index { None } else { Some(next) };
        }

        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
        self.len -= 1;
    }

    fn release(&mut self, index: usize) -> LbrState {
        let slot = &mut self.slots[index];
        let node = match slot.node.take() {
            Some(node) => node,
            None => fatal!("Releasing empty slot {}", index),
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        node.state
    }

    /// Remove `handle` together with every state descended from it through
    /// `parent`. Returns how many states were removed.
    pub fn remove(&mut self, handle: StateHandle) -> Result<usize, LbrError> {
        if self.is_empty() {
            log!(LogDebug, "Remove called on an empty state list");
            return Err(LbrError::StaleHandle);
        }
        let index = match self.live_index(handle) {
            Some(index) => index,
            None => {
                log!(LogDebug, "Remove called with a dead handle {:?}", handle);
                return Err(LbrError::StaleHandle);
            }
        };

        // Index parent links once, then collect the whole family before
        // touching anything. Fork chains can be arbitrarily deep.
        let mut children: HashMap<StateHandle, Vec<StateHandle>> = HashMap::new();
        for (child, state) in self.iter_rev() {
            if let Some(parent) = state.parent {
                children.entry(parent).or_default().push(child);
            }
        }

        let mut doomed = vec![index];
        let mut worklist = vec![handle];
        while let Some(parent) = worklist.pop() {
            for child in children.remove(&parent).unwrap_or_default() {
                if child == handle {
                    continue;
                }
                doomed.push(child.index as usize);
                worklist.push(child);
            }
        }

        // Every slot stays occupied until all of them are unlinked, so no
        // handle in the family can be reused halfway through.
        for &index in &doomed {
            self.unlink(index);
        }
        for &index in &doomed {
            let state = self.release(index);
            log!(LogDebug, "Removed LBR state for pid {}", state.pid);
        }
        Ok(doomed.len())
    }

    /// Release everything without looking at parent links. Only for
    /// shutdown: nothing is looked up again afterwards.
    pub fn drain_all(&mut self) -> usize {
        let drained = self.len;
        for index in 0..self.slots.len() {
            if self.slots[index].node.is_some() {
                self.release(index);
            }
        }
        self.head = None;
        self.len = 0;
        drained
    }

    /// Walks `next` links starting at the head.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
            forward: true,
        }
    }

    /// Walks `prev` links starting at the head (the order `find` searches).
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
            forward: false,
        }
    }
}

impl Default for StateList {
    fn default() -> Self {
        StateList::new()
    }
}

pub struct Iter<'a> {
    list: &'a StateList,
    cur: Option<usize>,
    forward: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (StateHandle, &'a LbrState);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        let node = self.list.node(cur);
        let step = if self.forward { node.next } else { node.prev };
        self.cur = if Some(step) == self.list.head {
            None
        } else {
            Some(step)
        };
        Some((self.list.handle_of(cur), &node.state))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lbr_state::LbrSelect;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn state(pid: u32) -> LbrState {
        LbrState::new(pid, LbrSelect::DEFAULT, 4).unwrap()
    }

    fn child(pid: u32, parent: StateHandle) -> LbrState {
        let mut s = state(pid);
        s.parent = Some(parent);
        s
    }

    fn pids_forward(list: &StateList) -> Vec<u32> {
        list.iter().map(|(_, s)| s.pid).collect()
    }

    fn pids_backward(list: &StateList) -> Vec<u32> {
        list.iter_rev().map(|(_, s)| s.pid).collect()
    }

    fn assert_consistent(list: &StateList) {
        let fwd = pids_forward(list);
        let bwd = pids_backward(list);
        assert_eq!(list.len(), fwd.len());
        assert_eq!(list.len(), bwd.len());
        assert_eq!(list.is_empty(), list.len() == 0);
        if let Some((first, rest)) = fwd.split_first() {
            // Backwards from the head: head first, then the tail, ...
            let mut expected = vec![*first];
            expected.extend(rest.iter().rev());
            assert_eq!(expected, bwd);
        }
    }

    #[test]
    fn empty_list() {
        let list = StateList::new();
        assert!(list.is_empty());
        assert_eq!(None, list.head());
        assert_eq!(None, list.find(1));
        assert_consistent(&list);
    }

    #[test]
    fn single_entry_links_to_itself() {
        let mut list = StateList::new();
        let h = list.insert(state(10)).unwrap();
        assert!(!list.is_empty());
        assert_eq!(Some(h), list.head());
        let index = h.index as usize;
        assert_eq!(index, list.node(index).prev);
        assert_eq!(index, list.node(index).next);
        assert_consistent(&list);
    }

    #[test]
    fn insert_appends_at_tail() {
        let mut list = StateList::new();
        for pid in 1..=4 {
            list.insert(state(pid)).unwrap();
        }
        assert_eq!(vec![1, 2, 3, 4], pids_forward(&list));
        assert_eq!(vec![1, 4, 3, 2], pids_backward(&list));
        assert_consistent(&list);
    }

    #[test]
    fn find_after_insert_and_remove() {
        let mut list = StateList::new();
        let a = list.insert(state(100)).unwrap();
        let b = list.insert(state(200)).unwrap();
        assert_eq!(Some(a), list.find(100));
        assert_eq!(Some(b), list.find(200));
        assert_eq!(None, list.find(300));

        assert_eq!(1, list.remove(b).unwrap());
        assert_eq!(None, list.find(200));
        assert!(list.get(b).is_none());
        assert_consistent(&list);
    }

    #[test]
    fn removing_head_promotes_successor() {
        let mut list = StateList::new();
        let a = list.insert(state(1)).unwrap();
        let b = list.insert(state(2)).unwrap();
        list.insert(state(3)).unwrap();
        list.remove(a).unwrap();
        assert_eq!(Some(b), list.head());
        assert_eq!(vec![2, 3], pids_forward(&list));
        assert_consistent(&list);
    }

    #[test]
    fn removing_last_entry_empties_list() {
        let mut list = StateList::new();
        let a = list.insert(state(1)).unwrap();
        list.remove(a).unwrap();
        assert!(list.is_empty());
        assert_eq!(0, list.len());
        assert_consistent(&list);
    }

    #[test]
    fn remove_twice_is_an_error() {
        let mut list = StateList::new();
        let a = list.insert(state(1)).unwrap();
        list.insert(state(2)).unwrap();
        list.remove(a).unwrap();
        match list.remove(a) {
            Err(LbrError::StaleHandle) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(1, list.len());
        assert_consistent(&list);
    }

    #[test]
    fn remove_on_empty_list_is_an_error() {
        let mut list = StateList::new();
        let a = list.insert(state(1)).unwrap();
        list.remove(a).unwrap();
        assert!(list.remove(a).is_err());
    }

    #[test]
    fn reused_slot_does_not_alias_old_handle() {
        let mut list = StateList::new();
        let a = list.insert(state(1)).unwrap();
        list.remove(a).unwrap();
        let b = list.insert(state(2)).unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a, b);
        assert!(list.get(a).is_none());
        assert_eq!(2, list.get(b).unwrap().pid);
    }

    #[test]
    fn cascading_remove() {
        let mut list = StateList::new();
        let unrelated = list.insert(state(1)).unwrap();
        let root = list.insert(state(10)).unwrap();
        let c1 = list.insert(child(11, root)).unwrap();
        let c2 = list.insert(child(12, root)).unwrap();
        list.insert(child(111, c1)).unwrap();
        list.insert(child(1111, list.find(111).unwrap())).unwrap();
        list.insert(child(121, c2)).unwrap();
        let other = list.insert(state(2)).unwrap();
        list.insert(child(21, other)).unwrap();
        assert_eq!(9, list.len());

        // root + 2 children + 3 grandchildren and below
        assert_eq!(6, list.remove(root).unwrap());
        assert_eq!(vec![1, 2, 21], pids_forward(&list));
        assert!(list.contains(unrelated));
        assert!(list.contains(other));
        assert_consistent(&list);
    }

    #[test]
    fn cascading_remove_of_head_subtree() {
        let mut list = StateList::new();
        let root = list.insert(state(10)).unwrap();
        list.insert(child(11, root)).unwrap();
        list.insert(state(3)).unwrap();
        assert_eq!(2, list.remove(root).unwrap());
        assert_eq!(vec![3], pids_forward(&list));
        assert_consistent(&list);
    }

    #[test]
    fn remove_deep_fork_chain() {
        let mut list = StateList::new();
        let root = list.insert(state(1)).unwrap();
        let mut parent = root;
        for pid in 2..=20_000 {
            parent = list.insert(child(pid, parent)).unwrap();
        }
        list.insert(state(30_000)).unwrap();
        assert_eq!(20_000, list.remove(root).unwrap());
        assert_eq!(vec![30_000], pids_forward(&list));
        assert!(list.get(parent).is_none());
        assert_consistent(&list);
    }

    #[test]
    fn drain_all_with_live_chains() {
        let mut list = StateList::new();
        let root = list.insert(state(10)).unwrap();
        let c = list.insert(child(11, root)).unwrap();
        list.insert(child(12, c)).unwrap();
        list.insert(state(20)).unwrap();
        assert_eq!(4, list.drain_all());
        assert!(list.is_empty());
        assert!(list.get(root).is_none());
        assert_eq!(None, list.find(12));
        assert_consistent(&list);
    }

    #[test]
    fn random_insert_remove_keeps_links_consistent() {
        let mut rng = StdRng::seed_from_u64(0x1b7);
        let mut list = StateList::new();
        let mut live: Vec<(u32, StateHandle)> = Vec::new();
        let mut next_pid = 1;

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let parent = if !live.is_empty() && rng.gen_bool(0.3) {
                    Some(live[rng.gen_range(0..live.len())].1)
                } else {
                    None
                };
                let mut s = state(next_pid);
                s.parent = parent;
                let h = list.insert(s).unwrap();
                live.push((next_pid, h));
                next_pid += 1;
            } else {
                let (_, h) = live[rng.gen_range(0..live.len())];
                let before = list.len();
                let removed = list.remove(h).unwrap();
                assert_eq!(before - removed, list.len());
                live.retain(|(_, h)| list.contains(*h));
            }

            assert_consistent(&list);
            assert_eq!(live.len(), list.len());
            for (pid, h) in &live {
                assert_eq!(Some(*h), list.find(*pid));
            }
        }
    }
}
