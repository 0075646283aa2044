//! # Synchronization Primitives
//!
//! Mutex, semaphore, event group and bounded queue, built only on the
//! scheduler's public block/unblock operations.
//!
//! Every blocking call takes a timeout in ticks: `None` waits forever and
//! `Some(0)` never blocks. A blocking call is split in two steps:
//! `begin_*` either succeeds at once or queues the caller and blocks it,
//! all under the primitive's lock, and `finish_*` runs once the task is
//! back on the CPU to learn whether it was served or timed out. On the
//! hosted port the two steps can be driven for any task, which is how the
//! tests exercise contention without a real context switch.
//!
//! Lock order is primitive lock, then scheduler core lock.

mod event_group;
mod mutex;
mod queue;
mod semaphore;

pub use event_group::EventGroup;
pub use mutex::Mutex;
pub use queue::Queue;
pub use semaphore::Semaphore;

use crate::arch::{Port, Tick};
use crate::config::MAX_TASKS;
use crate::error::SyncError;
use crate::scheduler::Scheduler;
use crate::task::TaskHandle;

/// One queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub handle: TaskHandle,
    /// Result handed over on wake-up (event bits).
    pub value: u32,
    pub clear_on_exit: bool,
    /// Served: the waiter got what it queued for and was unblocked.
    pub woken: bool,
}

impl Waiter {
    pub const fn new(handle: TaskHandle) -> Self {
        Self {
            handle,
            value: 0,
            clear_on_exit: false,
            woken: false,
        }
    }
}

/// FIFO of waiting tasks. Served entries stay until their task collects
/// them in `finish_*`.
pub(crate) struct WaitList {
    entries: [Option<Waiter>; MAX_TASKS],
    len: usize,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_TASKS],
            len: 0,
        }
    }

    pub fn push(&mut self, waiter: Waiter) -> Result<(), SyncError> {
        if self.len == MAX_TASKS {
            return Err(SyncError::Full);
        }
        self.entries[self.len] = Some(waiter);
        self.len += 1;
        Ok(())
    }

    /// Remove the entry for `handle`, keeping the order of the rest.
    pub fn take(&mut self, handle: TaskHandle) -> Option<Waiter> {
        let index = self.iter().position(|w| w.handle == handle)?;
        self.remove(index)
    }

    fn remove(&mut self, index: usize) -> Option<Waiter> {
        let out = self.entries[index].take();
        self.entries[index..self.len].rotate_left(1);
        self.len -= 1;
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waiter> {
        self.entries[..self.len].iter().flatten()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Waiter> {
        self.entries[..self.len].get_mut(index)?.as_mut()
    }

    /// Entries still waiting to be served.
    pub fn pending(&self) -> impl Iterator<Item = &Waiter> {
        self.iter().filter(|w| !w.woken)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Serve entry `index`: mark it woken and unblock its task. A task that
    /// no longer exists is dropped from the list and `false` returned.
    pub fn serve<P: Port>(&mut self, index: usize, sched: &Scheduler<'_, P>) -> bool {
        let Some(w) = self.get_mut(index) else {
            return false;
        };
        w.woken = true;
        let handle = w.handle;
        match sched.task_unblock(handle) {
            Ok(_) => true,
            Err(_) => {
                self.remove(index);
                false
            }
        }
    }

    /// Serve the oldest pending entry whose task still exists.
    pub fn serve_first<P: Port>(&mut self, sched: &Scheduler<'_, P>) -> Option<TaskHandle> {
        loop {
            let index = (0..self.len).find(|&i| matches!(self.entries[i], Some(w) if !w.woken))?;
            let handle = self.entries[index].map(|w| w.handle)?;
            if self.serve(index, sched) {
                return Some(handle);
            }
        }
    }
}

/// Absolute wake-up tick for `timeout`.
pub(crate) fn deadline<P: Port>(sched: &Scheduler<'_, P>, timeout: Option<Tick>) -> Option<Tick> {
    timeout.map(|t| sched.port().now().wrapping_add(t))
}

pub(crate) fn current<P: Port>(sched: &Scheduler<'_, P>) -> Result<TaskHandle, SyncError> {
    sched.current_task().ok_or(SyncError::NoCurrentTask)
}

/// Queue `waiter` on `list` and block its task until `wake_at`.
pub(crate) fn park<P: Port>(
    list: &mut WaitList,
    sched: &Scheduler<'_, P>,
    waiter: Waiter,
    timeout: Option<Tick>,
) -> Result<(), SyncError> {
    if timeout == Some(0) {
        return Err(SyncError::WouldBlock);
    }
    list.push(waiter)?;
    if let Err(e) = sched.task_block(waiter.handle, deadline(sched, timeout)) {
        list.take(waiter.handle);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WEIGHT_NORMAL;
    use crate::task::TaskState;
    use crate::testing::*;

    #[test]
    fn test_wait_list_fifo_and_take() {
        let s = fixture();
        let a = spawn(s, WEIGHT_NORMAL);
        let b = spawn(s, WEIGHT_NORMAL);
        let c = spawn(s, WEIGHT_NORMAL);
        let mut list = WaitList::new();
        for h in [a, b, c] {
            list.push(Waiter::new(h)).unwrap();
        }
        assert_eq!(list.take(b).map(|w| w.handle), Some(b));
        assert!(list.take(b).is_none());
        let order: Vec<_> = list.iter().map(|w| w.handle).collect();
        assert_eq!(order, vec![a, c]);
    }

    #[test]
    fn test_serve_first_skips_deleted_tasks() {
        let s = fixture();
        let a = spawn(s, WEIGHT_NORMAL);
        let b = spawn(s, WEIGHT_NORMAL);
        let mut list = WaitList::new();
        park(&mut list, s, Waiter::new(a), None).unwrap();
        park(&mut list, s, Waiter::new(b), None).unwrap();
        s.task_delete(a.id()).unwrap();

        assert_eq!(list.serve_first(s), Some(b));
        assert_eq!(s.task_state(b), Ok(TaskState::Ready));
        assert_eq!(list.pending_count(), 0);
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.serve_first(s), None);
    }

    #[test]
    fn test_park_zero_timeout_does_not_block() {
        let s = fixture();
        let a = spawn(s, WEIGHT_NORMAL);
        let mut list = WaitList::new();
        assert_eq!(park(&mut list, s, Waiter::new(a), Some(0)), Err(SyncError::WouldBlock));
        assert_eq!(s.task_state(a), Ok(TaskState::Ready));
        assert_eq!(list.iter().count(), 0);
    }
}
