//! 32-bit event flags. Waiters ask for any or all bits of a mask; `set`
//! wakes every waiter whose condition now holds and then clears the bits
//! claimed by waiters that asked for clear-on-exit.

use super::{current, park, WaitList, Waiter};
use crate::arch::{Port, Tick};
use crate::error::SyncError;
use crate::scheduler::Scheduler;
use crate::sync::IrqLock;
use crate::task::TaskHandle;

struct EventState {
    bits: u32,
    waiters: WaitList,
}

pub struct EventGroup {
    state: IrqLock<EventState>,
}

#[inline]
fn satisfied(bits: u32, mask: u32, wait_all: bool) -> bool {
    if wait_all {
        bits & mask == mask
    } else {
        bits & mask != 0
    }
}

impl EventGroup {
    pub const fn new() -> Self {
        Self {
            state: IrqLock::new(EventState {
                bits: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn get(&self) -> u32 {
        self.state.lock().bits
    }

    /// Clear `bits`, returning the flags as they were before.
    pub fn clear(&self, bits: u32) -> u32 {
        let mut s = self.state.lock();
        let old = s.bits;
        s.bits &= !bits;
        old
    }

    /// Set `bits` and release the waiters they satisfy. Returns the flags
    /// left after clear-on-exit.
    pub fn set<P: Port>(&self, sched: &Scheduler<'_, P>, bits: u32) -> u32 {
        let mut s = self.state.lock();
        s.bits |= bits;
        let mut to_clear = 0;
        let mut i = 0;
        while let Some(w) = s.waiters.get_mut(i).copied() {
            if w.woken {
                i += 1;
                continue;
            }
            let Ok((mask, wait_all)) = sched.task_event_wait_mask(w.handle) else {
                s.waiters.take(w.handle);
                continue;
            };
            if !satisfied(s.bits, mask, wait_all) {
                i += 1;
                continue;
            }
            let snapshot = s.bits;
            if let Some(entry) = s.waiters.get_mut(i) {
                entry.value = snapshot;
            }
            if w.clear_on_exit {
                to_clear |= mask;
            }
            if s.waiters.serve(i, sched) {
                i += 1;
            }
        }
        s.bits &= !to_clear;
        s.bits
    }

    /// Wait until `mask` is satisfied. Returns the flags at the moment the
    /// wait was satisfied.
    pub fn wait<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        mask: u32,
        wait_all: bool,
        clear_on_exit: bool,
        timeout: Option<Tick>,
    ) -> Result<u32, SyncError> {
        let me = current(sched)?;
        if let Some(bits) = self.begin_wait(sched, me, mask, wait_all, clear_on_exit, timeout)? {
            return Ok(bits);
        }
        sched.task_resume_current(me);
        self.finish_wait(sched, me)
    }

    /// Return the flags if `mask` is already satisfied, otherwise queue and
    /// block `who` and return `None`.
    pub fn begin_wait<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        who: TaskHandle,
        mask: u32,
        wait_all: bool,
        clear_on_exit: bool,
        timeout: Option<Tick>,
    ) -> Result<Option<u32>, SyncError> {
        let mut s = self.state.lock();
        if satisfied(s.bits, mask, wait_all) || mask == 0 {
            let bits = s.bits;
            if clear_on_exit {
                s.bits &= !mask;
            }
            return Ok(Some(bits));
        }
        sched.task_set_event_wait(who, mask, wait_all)?;
        let waiter = Waiter {
            clear_on_exit,
            ..Waiter::new(who)
        };
        if let Err(e) = park(&mut s.waiters, sched, waiter, timeout) {
            let _ = sched.task_set_event_wait(who, 0, false);
            return Err(e);
        }
        Ok(None)
    }

    pub fn finish_wait<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        who: TaskHandle,
    ) -> Result<u32, SyncError> {
        let entry = self.state.lock().waiters.take(who);
        let _ = sched.task_set_event_wait(who, 0, false);
        match entry {
            Some(w) if w.woken => Ok(w.value),
            _ => Err(SyncError::Timeout),
        }
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WEIGHT_NORMAL;
    use crate::task::TaskState;
    use crate::testing::*;

    #[test]
    fn test_immediate_any_and_all() {
        let s = fixture();
        let a = spawn(s, WEIGHT_NORMAL);
        let ev = EventGroup::new();
        ev.set(s, 0b0101);
        assert_eq!(ev.begin_wait(s, a, 0b0100, false, false, None), Ok(Some(0b0101)));
        assert_eq!(
            ev.begin_wait(s, a, 0b0110, true, false, Some(0)),
            Err(SyncError::WouldBlock)
        );
        assert_eq!(ev.begin_wait(s, a, 0b0101, true, true, None), Ok(Some(0b0101)));
        assert_eq!(ev.get(), 0);
        assert_eq!(s.task_state(a), Ok(TaskState::Ready));
    }

    #[test]
    fn test_set_wakes_every_satisfied_waiter() {
        let s = fixture();
        let any = spawn(s, WEIGHT_NORMAL);
        let all = spawn(s, WEIGHT_NORMAL);
        let other = spawn(s, WEIGHT_NORMAL);
        let ev = EventGroup::new();
        assert_eq!(ev.begin_wait(s, any, 0b0011, false, true, None), Ok(None));
        assert_eq!(ev.begin_wait(s, all, 0b0011, true, false, None), Ok(None));
        assert_eq!(ev.begin_wait(s, other, 0b1000, false, false, None), Ok(None));

        ev.set(s, 0b0001);
        assert_eq!(s.task_state(any), Ok(TaskState::Ready));
        assert_eq!(s.task_state(all), Ok(TaskState::Blocked));
        assert_eq!(ev.get(), 0, "clear-on-exit waiter consumed its bits");

        ev.set(s, 0b0011);
        assert_eq!(s.task_state(all), Ok(TaskState::Ready));
        assert_eq!(s.task_state(other), Ok(TaskState::Blocked));
        assert_eq!(ev.get(), 0b0011);

        assert_eq!(ev.finish_wait(s, any), Ok(0b0001));
        assert_eq!(ev.finish_wait(s, all), Ok(0b0011));
        assert_eq!(s.task_event_wait_mask(all), Ok((0, false)));
    }

    #[test]
    fn test_wait_times_out_on_hosted_port() {
        let s = fixture();
        let a = spawn_on(s, 0, WEIGHT_NORMAL);
        assert_eq!(dispatch(s, 0), Some(a));
        let ev = EventGroup::new();
        assert_eq!(ev.wait(s, 0b1, false, false, Some(4)), Err(SyncError::Timeout));
        assert_eq!(s.task_state(a), Ok(TaskState::Running));
        ev.set(s, 0b1);
        assert_eq!(ev.wait(s, 0b1, false, true, Some(4)), Ok(0b1));
        assert_eq!(ev.get(), 0);
    }
}
