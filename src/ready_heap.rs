//! # Ready Heap
//!
//! Per-core binary min-heap of ready task slots keyed by virtual runtime.
//!
//! The heap stores slot numbers only. Keys and back-indices live in the
//! task records and are reached through [`HeapSlots`], which lets every
//! task know where it sits so it can be removed from the middle of the heap
//! in O(log N) when it blocks, is deleted, or has its weight changed.

use crate::config::MAX_TASKS;
use crate::task::vruntime_before;

/// Access to the per-slot data the heap orders by and maintains.
pub trait HeapSlots {
    /// Virtual runtime of `slot`.
    fn key(&self, slot: usize) -> u64;
    /// Record where `slot` now lives, or that it left the heap.
    fn set_index(&mut self, slot: usize, index: Option<usize>);
}

pub struct ReadyHeap {
    slots: [usize; MAX_TASKS],
    len: usize,
}

impl ReadyHeap {
    pub const fn new() -> Self {
        Self {
            slots: [0; MAX_TASKS],
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot with the smallest virtual runtime.
    #[inline]
    pub fn peek(&self) -> Option<usize> {
        (self.len > 0).then(|| self.slots[0])
    }

    /// Slot stored at heap position `index`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<usize> {
        (index < self.len).then(|| self.slots[index])
    }

    pub fn push<S: HeapSlots>(&mut self, slot: usize, tasks: &mut S) {
        debug_assert!(self.len < MAX_TASKS, "ready heap overflow");
        let index = self.len;
        self.slots[index] = slot;
        self.len += 1;
        tasks.set_index(slot, Some(index));
        self.sift_up(index, tasks);
    }

    pub fn pop<S: HeapSlots>(&mut self, tasks: &mut S) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        Some(self.remove(0, tasks))
    }

    /// Remove the entry at heap position `index` and return its slot.
    pub fn remove<S: HeapSlots>(&mut self, index: usize, tasks: &mut S) -> usize {
        debug_assert!(index < self.len);
        let slot = self.slots[index];
        self.len -= 1;
        if index != self.len {
            let moved = self.slots[self.len];
            self.slots[index] = moved;
            tasks.set_index(moved, Some(index));
            self.sift_down(index, tasks);
            self.sift_up(index, tasks);
        }
        tasks.set_index(slot, None);
        slot
    }

    /// Restore heap order after the key at `index` changed.
    pub fn update<S: HeapSlots>(&mut self, index: usize, tasks: &mut S) {
        self.sift_down(index, tasks);
        self.sift_up(index, tasks);
    }

    fn less<S: HeapSlots>(&self, a: usize, b: usize, tasks: &S) -> bool {
        vruntime_before(tasks.key(self.slots[a]), tasks.key(self.slots[b]))
    }

    fn swap<S: HeapSlots>(&mut self, a: usize, b: usize, tasks: &mut S) {
        self.slots.swap(a, b);
        tasks.set_index(self.slots[a], Some(a));
        tasks.set_index(self.slots[b], Some(b));
    }

    fn sift_up<S: HeapSlots>(&mut self, mut index: usize, tasks: &mut S) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent, tasks) {
                break;
            }
            self.swap(index, parent, tasks);
            index = parent;
        }
    }

    fn sift_down<S: HeapSlots>(&mut self, mut index: usize, tasks: &mut S) {
        loop {
            let left = 2 * index + 1;
            if left >= self.len {
                break;
            }
            let right = left + 1;
            let child = if right < self.len && self.less(right, left, tasks) {
                right
            } else {
                left
            };
            if !self.less(child, index, tasks) {
                break;
            }
            self.swap(index, child, tasks);
            index = child;
        }
    }
}

impl Default for ReadyHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Keys {
        key: [u64; MAX_TASKS],
        index: [Option<usize>; MAX_TASKS],
    }

    impl Keys {
        fn new() -> Self {
            Self { key: [0; MAX_TASKS], index: [None; MAX_TASKS] }
        }
    }

    impl HeapSlots for Keys {
        fn key(&self, slot: usize) -> u64 {
            self.key[slot]
        }
        fn set_index(&mut self, slot: usize, index: Option<usize>) {
            self.index[slot] = index;
        }
    }

    fn assert_back_links(heap: &ReadyHeap, keys: &Keys) {
        for i in 0..heap.len() {
            let slot = heap.get(i).unwrap();
            assert_eq!(keys.index[slot], Some(i));
        }
    }

    #[test]
    fn test_pops_in_key_order() {
        let mut keys = Keys::new();
        let mut heap = ReadyHeap::new();
        let order = [5u64, 1, 9, 3, 7, 2];
        for (slot, k) in order.iter().enumerate() {
            keys.key[slot] = *k;
            heap.push(slot, &mut keys);
            assert_back_links(&heap, &keys);
        }
        let mut out = [0u64; 6];
        for o in out.iter_mut() {
            let slot = heap.pop(&mut keys).unwrap();
            assert_eq!(keys.index[slot], None);
            *o = keys.key[slot];
        }
        assert_eq!(out, [1, 2, 3, 5, 7, 9]);
        assert!(heap.pop(&mut keys).is_none());
    }

    #[test]
    fn test_remove_from_middle_keeps_order() {
        let mut keys = Keys::new();
        let mut heap = ReadyHeap::new();
        for slot in 0..8 {
            keys.key[slot] = (slot as u64 * 37) % 11;
            heap.push(slot, &mut keys);
        }
        let victim = 4;
        let idx = keys.index[victim].unwrap();
        assert_eq!(heap.remove(idx, &mut keys), victim);
        assert_eq!(keys.index[victim], None);
        assert_back_links(&heap, &keys);

        let mut last = 0;
        while let Some(slot) = heap.pop(&mut keys) {
            assert_ne!(slot, victim);
            assert!(keys.key[slot] >= last);
            last = keys.key[slot];
        }
    }

    #[test]
    fn test_update_after_key_change() {
        let mut keys = Keys::new();
        let mut heap = ReadyHeap::new();
        for slot in 0..4 {
            keys.key[slot] = 10 * (slot as u64 + 1);
            heap.push(slot, &mut keys);
        }
        keys.key[3] = 5;
        heap.update(keys.index[3].unwrap(), &mut keys);
        assert_eq!(heap.peek(), Some(3));
        assert_back_links(&heap, &keys);

        // Raise the root; it must sink below everything else.
        keys.key[3] = 100;
        heap.update(keys.index[3].unwrap(), &mut keys);
        assert_eq!(heap.peek(), Some(0));
        assert_back_links(&heap, &keys);
        let order: Vec<usize> = core::iter::from_fn(|| heap.pop(&mut keys)).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_order_survives_wraparound() {
        let mut keys = Keys::new();
        let mut heap = ReadyHeap::new();
        keys.key[0] = 3; // logically after u64::MAX
        keys.key[1] = u64::MAX - 2;
        heap.push(0, &mut keys);
        heap.push(1, &mut keys);
        assert_eq!(heap.pop(&mut keys), Some(1));
        assert_eq!(heap.pop(&mut keys), Some(0));
    }
}
