//! Mutex with priority inheritance and direct handoff.
//!
//! While tasks wait, the owner runs with the weight of the heaviest waiter
//! if that is more than its own. Unlock restores the owner's base weight and
//! hands ownership straight to the heaviest waiter (oldest first among
//! equals), so a woken task never has to race for the lock.

use super::{current, park, WaitList, Waiter};
use crate::arch::{Port, Tick};
use crate::error::SyncError;
use crate::scheduler::Scheduler;
use crate::sync::IrqLock;
use crate::task::TaskHandle;

struct MutexState {
    owner: Option<TaskHandle>,
    waiters: WaitList,
}

pub struct Mutex {
    state: IrqLock<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: IrqLock::new(MutexState {
                owner: None,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn owner(&self) -> Option<TaskHandle> {
        self.state.lock().owner
    }

    /// Number of tasks queued and not yet handed the lock.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.pending_count()
    }

    pub fn try_lock<P: Port>(&self, sched: &Scheduler<'_, P>) -> Result<(), SyncError> {
        let me = current(sched)?;
        let mut s = self.state.lock();
        if s.owner.is_some() {
            return Err(SyncError::WouldBlock);
        }
        s.owner = Some(me);
        Ok(())
    }

    /// Acquire the mutex, waiting at most `timeout` ticks.
    pub fn lock<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        timeout: Option<Tick>,
    ) -> Result<(), SyncError> {
        let me = current(sched)?;
        if self.begin_wait(sched, me, timeout)? {
            return Ok(());
        }
        sched.task_resume_current(me);
        self.finish_wait(sched, me)
    }

    /// Take the mutex for `who` if it is free (`Ok(true)`), otherwise queue
    /// and block `who` and boost the owner (`Ok(false)`).
    pub fn begin_wait<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        who: TaskHandle,
        timeout: Option<Tick>,
    ) -> Result<bool, SyncError> {
        let mut s = self.state.lock();
        let owner = match s.owner {
            None => {
                s.owner = Some(who);
                return Ok(true);
            }
            // Not recursive.
            Some(owner) if owner == who => return Err(SyncError::WouldBlock),
            Some(owner) => owner,
        };
        park(&mut s.waiters, sched, Waiter::new(who), timeout)?;

        let weight = sched.task_weight(who)?;
        if let Ok(held) = sched.task_weight(owner) {
            if weight > held {
                log::debug!("mutex: boosting task {} to weight {}", owner.id(), weight);
                let _ = sched.task_set_weight(owner, weight);
            }
        }
        Ok(false)
    }

    /// Collect the outcome of a wait started with [`Mutex::begin_wait`].
    /// On timeout the waiter is dequeued and the owner's boost recomputed.
    pub fn finish_wait<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        who: TaskHandle,
    ) -> Result<(), SyncError> {
        let mut s = self.state.lock();
        s.waiters.take(who);
        if s.owner == Some(who) {
            return Ok(());
        }
        Self::reboost(&s, sched);
        Err(SyncError::Timeout)
    }

    /// Release the mutex held by the calling task.
    pub fn unlock<P: Port>(&self, sched: &Scheduler<'_, P>) -> Result<(), SyncError> {
        let me = current(sched)?;
        let mut s = self.state.lock();
        if s.owner != Some(me) {
            return Err(SyncError::NotOwner);
        }
        let base = sched.task_base_weight(me)?;
        sched.task_set_weight(me, base)?;
        s.owner = None;

        while let Some(index) = Self::heaviest(&s.waiters, sched) {
            let Some(next) = s.waiters.get_mut(index).map(|w| w.handle) else {
                break;
            };
            if s.waiters.serve(index, sched) {
                s.owner = Some(next);
                Self::reboost(&s, sched);
                break;
            }
        }
        Ok(())
    }

    /// Index of the heaviest pending waiter, the oldest among equals.
    fn heaviest<P: Port>(waiters: &WaitList, sched: &Scheduler<'_, P>) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (i, w) in waiters.iter().enumerate() {
            if w.woken {
                continue;
            }
            let weight = sched.task_weight(w.handle).unwrap_or(0);
            if best.map_or(true, |(_, b)| weight > b) {
                best = Some((i, weight));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Set the owner's weight to its base or the heaviest pending waiter's,
    /// whichever is larger.
    fn reboost<P: Port>(s: &MutexState, sched: &Scheduler<'_, P>) {
        let Some(owner) = s.owner else {
            return;
        };
        let Ok(base) = sched.task_base_weight(owner) else {
            return;
        };
        let top = s
            .waiters
            .pending()
            .filter_map(|w| sched.task_weight(w.handle).ok())
            .max()
            .unwrap_or(0);
        let _ = sched.task_set_weight(owner, base.max(top));
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_CORES, TIME_SLICE_TICKS, WEIGHT_HIGH, WEIGHT_LOW, WEIGHT_NORMAL};
    use crate::task::TaskState;
    use crate::testing::*;

    #[test]
    fn test_try_lock_and_unlock() {
        let s = fixture();
        let a = spawn_on(s, 0, WEIGHT_NORMAL);
        assert_eq!(dispatch(s, 0), Some(a));
        let m = Mutex::new();
        m.try_lock(s).unwrap();
        assert_eq!(m.owner(), Some(a));
        assert_eq!(m.try_lock(s), Err(SyncError::WouldBlock));
        m.unlock(s).unwrap();
        assert_eq!(m.owner(), None);
        assert_eq!(m.unlock(s), Err(SyncError::NotOwner));
    }

    #[test]
    fn test_priority_inheritance_boost_and_restore() {
        let s = fixture();
        let low = spawn_on(s, 0, WEIGHT_LOW);
        let high = spawn(s, WEIGHT_HIGH);
        assert_eq!(dispatch(s, 0), Some(low));

        let m = Mutex::new();
        m.lock(s, None).unwrap();
        assert_eq!(m.begin_wait(s, high, None), Ok(false));
        assert_eq!(s.task_state(high), Ok(TaskState::Blocked));
        assert_eq!(s.task_weight(low), Ok(WEIGHT_HIGH));
        assert_eq!(s.task_base_weight(low), Ok(WEIGHT_LOW));

        m.unlock(s).unwrap();
        assert_eq!(s.task_weight(low), Ok(WEIGHT_LOW));
        assert_eq!(m.owner(), Some(high));
        assert_eq!(s.task_state(high), Ok(TaskState::Ready));
        assert_eq!(m.finish_wait(s, high), Ok(()));
        assert_eq!(m.waiting(), 0);
    }

    #[test]
    fn test_handoff_prefers_heaviest_then_oldest() {
        let s = fixture();
        let owner = spawn_on(s, 0, WEIGHT_NORMAL);
        let b = spawn(s, WEIGHT_NORMAL);
        let c = spawn(s, WEIGHT_HIGH);
        let d = spawn(s, WEIGHT_HIGH);
        assert_eq!(dispatch(s, 0), Some(owner));

        let m = Mutex::new();
        m.try_lock(s).unwrap();
        for h in [b, c, d] {
            assert_eq!(m.begin_wait(s, h, None), Ok(false));
        }
        m.unlock(s).unwrap();
        assert_eq!(m.owner(), Some(c));
        assert_eq!(s.task_state(c), Ok(TaskState::Ready));
        assert_eq!(s.task_state(d), Ok(TaskState::Blocked));
        assert_eq!(s.task_weight(c), Ok(WEIGHT_HIGH));
        assert_eq!(m.waiting(), 2);
    }

    #[test]
    fn test_timeout_dequeues_and_drops_boost() {
        let s = fixture();
        let low = spawn_on(s, 0, WEIGHT_LOW);
        assert_eq!(dispatch(s, 0), Some(low));
        let high = spawn(s, WEIGHT_HIGH);

        let m = Mutex::new();
        m.try_lock(s).unwrap();
        m.begin_wait(s, high, Some(5)).unwrap();
        assert_eq!(s.task_state(high), Ok(TaskState::Sleeping));
        assert_eq!(s.task_weight(low), Ok(WEIGHT_HIGH));

        s.port().set_tick(5);
        for core in 0..MAX_CORES {
            s.port().set_core(core);
            s.scheduler_tick();
        }
        assert_eq!(m.finish_wait(s, high), Err(SyncError::Timeout));
        assert_eq!(m.waiting(), 0);
        assert_eq!(s.task_weight(low), Ok(WEIGHT_LOW));
        assert_eq!(m.owner(), Some(low));
    }

    #[test]
    fn test_lock_on_hosted_port_times_out_cleanly() {
        let s = fixture();
        let owner = spawn_on(s, 0, WEIGHT_NORMAL);
        let other = spawn_on(s, 0, WEIGHT_NORMAL);
        assert_eq!(dispatch(s, 0), Some(owner));
        let m = Mutex::new();
        m.try_lock(s).unwrap();

        // Switch the core over to `other` and contend.
        s.port().advance(TIME_SLICE_TICKS);
        assert_eq!(dispatch(s, 0), Some(other));
        assert_eq!(m.lock(s, Some(0)), Err(SyncError::WouldBlock));
        assert_eq!(m.lock(s, Some(10)), Err(SyncError::Timeout));
        assert_eq!(s.task_state(other), Ok(TaskState::Running));
        assert_eq!(m.waiting(), 0);
    }
}
