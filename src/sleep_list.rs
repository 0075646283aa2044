//! # Sleep List
//!
//! Per-core singly linked list of sleeping tasks, sorted by wake-up tick.
//!
//! The links are threaded through each task's [`Link::Sleep`] role, so the
//! list owns no storage of its own beyond the head. Insertion walks the list
//! (O(N)); expiry only ever looks at the head. Equal deadlines keep their
//! insertion order.

use crate::arch::{tick_before, Tick};
use crate::task::Link;

/// Access to the per-slot data the list threads through.
pub trait SleepSlots {
    fn wake_at(&self, slot: usize) -> Tick;
    fn link(&self, slot: usize) -> Link;
    fn set_link(&mut self, slot: usize, link: Link);
}

fn next_of<S: SleepSlots>(tasks: &S, slot: usize) -> Option<usize> {
    match tasks.link(slot) {
        Link::Sleep(next) => next,
        other => {
            debug_assert!(false, "slot {} on sleep list with link {:?}", slot, other);
            None
        }
    }
}

pub struct SleepList {
    head: Option<usize>,
}

impl SleepList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Insert `slot` after every entry due no later than it.
    pub fn insert<S: SleepSlots>(&mut self, slot: usize, tasks: &mut S) {
        debug_assert_eq!(tasks.link(slot), Link::None, "slot {} already linked", slot);
        let due = tasks.wake_at(slot);

        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if tick_before(due, tasks.wake_at(c)) {
                break;
            }
            prev = Some(c);
            cur = next_of(tasks, c);
        }

        tasks.set_link(slot, Link::Sleep(cur));
        match prev {
            Some(p) => tasks.set_link(p, Link::Sleep(Some(slot))),
            None => self.head = Some(slot),
        }
    }

    /// Unlink `slot`. Returns `false` if it was not on the list.
    pub fn remove<S: SleepSlots>(&mut self, slot: usize, tasks: &mut S) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let next = next_of(tasks, c);
            if c == slot {
                match prev {
                    Some(p) => tasks.set_link(p, Link::Sleep(next)),
                    None => self.head = next,
                }
                tasks.set_link(slot, Link::None);
                return true;
            }
            prev = Some(c);
            cur = next;
        }
        false
    }

    /// Pop the head if its deadline is not after `now`.
    pub fn pop_expired<S: SleepSlots>(&mut self, now: Tick, tasks: &mut S) -> Option<usize> {
        let head = self.head?;
        if tick_before(now, tasks.wake_at(head)) {
            return None;
        }
        self.head = next_of(tasks, head);
        tasks.set_link(head, Link::None);
        Some(head)
    }
}

impl Default for SleepList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slots {
        wake: [Tick; 8],
        link: [Link; 8],
    }

    impl Slots {
        fn new() -> Self {
            Self { wake: [0; 8], link: [Link::None; 8] }
        }
    }

    impl SleepSlots for Slots {
        fn wake_at(&self, slot: usize) -> Tick {
            self.wake[slot]
        }
        fn link(&self, slot: usize) -> Link {
            self.link[slot]
        }
        fn set_link(&mut self, slot: usize, link: Link) {
            self.link[slot] = link;
        }
    }

    fn drain(list: &mut SleepList, now: Tick, slots: &mut Slots) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(s) = list.pop_expired(now, slots) {
            out.push(s);
        }
        out
    }

    #[test]
    fn test_sorted_with_stable_ties() {
        let mut slots = Slots::new();
        let mut list = SleepList::new();
        for (slot, wake) in [(0, 30), (1, 10), (2, 20), (3, 10)] {
            slots.wake[slot] = wake;
            list.insert(slot, &mut slots);
        }
        assert_eq!(drain(&mut list, 100, &mut slots), vec![1, 3, 2, 0]);
        assert!(list.is_empty());
        assert!(slots.link.iter().all(|l| *l == Link::None));
    }

    #[test]
    fn test_pop_expired_respects_now() {
        let mut slots = Slots::new();
        let mut list = SleepList::new();
        slots.wake[0] = 20;
        slots.wake[1] = 10;
        list.insert(0, &mut slots);
        list.insert(1, &mut slots);
        assert!(drain(&mut list, 9, &mut slots).is_empty());
        assert_eq!(drain(&mut list, 10, &mut slots), vec![1]);
        assert_eq!(drain(&mut list, 20, &mut slots), vec![0]);
    }

    #[test]
    fn test_remove_middle_and_missing() {
        let mut slots = Slots::new();
        let mut list = SleepList::new();
        for slot in 0..3 {
            slots.wake[slot] = slot as Tick;
            list.insert(slot, &mut slots);
        }
        assert!(list.remove(1, &mut slots));
        assert!(!list.remove(1, &mut slots));
        assert_eq!(slots.link[1], Link::None);
        assert_eq!(drain(&mut list, 10, &mut slots), vec![0, 2]);
    }

    #[test]
    fn test_deadlines_across_wraparound() {
        let mut slots = Slots::new();
        let mut list = SleepList::new();
        slots.wake[0] = 5; // after the wrap
        slots.wake[1] = Tick::MAX - 5;
        list.insert(0, &mut slots);
        list.insert(1, &mut slots);
        assert_eq!(list.head(), Some(1));
        assert_eq!(drain(&mut list, Tick::MAX, &mut slots), vec![1]);
        assert_eq!(drain(&mut list, 5, &mut slots), vec![0]);
    }
}
