//! Counting semaphore. `give` hands a permit directly to the oldest waiter
//! instead of bumping the count, so a permit can't be stolen between the
//! wake-up and the waiter running.

use super::{current, park, WaitList, Waiter};
use crate::arch::{Port, Tick};
use crate::error::SyncError;
use crate::scheduler::Scheduler;
use crate::sync::IrqLock;
use crate::task::TaskHandle;

struct SemState {
    count: u32,
    max: u32,
    waiters: WaitList,
}

pub struct Semaphore {
    state: IrqLock<SemState>,
}

impl Semaphore {
    /// `initial` is clamped to `max`.
    pub const fn new(initial: u32, max: u32) -> Self {
        let count = if initial > max { max } else { initial };
        Self {
            state: IrqLock::new(SemState {
                count,
                max,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.pending_count()
    }

    pub fn try_take(&self) -> Result<(), SyncError> {
        let mut s = self.state.lock();
        if s.count == 0 {
            return Err(SyncError::WouldBlock);
        }
        s.count -= 1;
        Ok(())
    }

    pub fn take<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        timeout: Option<Tick>,
    ) -> Result<(), SyncError> {
        let me = current(sched)?;
        if self.begin_take(sched, me, timeout)? {
            return Ok(());
        }
        sched.task_resume_current(me);
        self.finish_take(me)
    }

    /// Take a permit for `who` (`Ok(true)`) or queue and block it.
    pub fn begin_take<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        who: TaskHandle,
        timeout: Option<Tick>,
    ) -> Result<bool, SyncError> {
        let mut s = self.state.lock();
        if s.count > 0 {
            s.count -= 1;
            return Ok(true);
        }
        park(&mut s.waiters, sched, Waiter::new(who), timeout)?;
        Ok(false)
    }

    pub fn finish_take(&self, who: TaskHandle) -> Result<(), SyncError> {
        match self.state.lock().waiters.take(who) {
            Some(w) if w.woken => Ok(()),
            _ => Err(SyncError::Timeout),
        }
    }

    /// Release one permit. Fails with `Full` if the count is at its maximum
    /// and nobody is waiting.
    pub fn give<P: Port>(&self, sched: &Scheduler<'_, P>) -> Result<(), SyncError> {
        let mut s = self.state.lock();
        if s.waiters.serve_first(sched).is_some() {
            return Ok(());
        }
        if s.count >= s.max {
            return Err(SyncError::Full);
        }
        s.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WEIGHT_NORMAL;
    use crate::task::TaskState;
    use crate::testing::*;

    #[test]
    fn test_counting_and_bounds() {
        let s = fixture();
        let sem = Semaphore::new(5, 2);
        assert_eq!(sem.count(), 2);
        sem.try_take().unwrap();
        sem.try_take().unwrap();
        assert_eq!(sem.try_take(), Err(SyncError::WouldBlock));
        sem.give(s).unwrap();
        sem.give(s).unwrap();
        assert_eq!(sem.give(s), Err(SyncError::Full));
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn test_give_hands_permit_to_oldest_waiter() {
        let s = fixture();
        let a = spawn(s, WEIGHT_NORMAL);
        let b = spawn(s, WEIGHT_NORMAL);
        let sem = Semaphore::new(0, 4);
        assert_eq!(sem.begin_take(s, a, None), Ok(false));
        assert_eq!(sem.begin_take(s, b, None), Ok(false));
        assert_eq!(sem.waiting(), 2);

        sem.give(s).unwrap();
        assert_eq!(sem.count(), 0);
        assert_eq!(s.task_state(a), Ok(TaskState::Ready));
        assert_eq!(s.task_state(b), Ok(TaskState::Blocked));
        assert_eq!(sem.finish_take(a), Ok(()));
        assert_eq!(sem.waiting(), 1);
    }

    #[test]
    fn test_take_times_out() {
        let s = fixture();
        let a = spawn_on(s, 0, WEIGHT_NORMAL);
        assert_eq!(dispatch(s, 0), Some(a));
        let sem = Semaphore::new(0, 1);
        assert_eq!(sem.take(s, Some(0)), Err(SyncError::WouldBlock));
        assert_eq!(sem.take(s, Some(3)), Err(SyncError::Timeout));
        assert_eq!(sem.waiting(), 0);
        assert_eq!(s.task_state(a), Ok(TaskState::Running));
        sem.give(s).unwrap();
        assert_eq!(sem.take(s, None), Ok(()));
    }
}
