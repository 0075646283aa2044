//! Bounded FIFO of `Copy` items with blocking send and receive.
//!
//! A blocked sender or receiver is woken when space or an item shows up and
//! then retries; its original deadline still applies.

use super::{current, park, WaitList, Waiter};
use crate::arch::{tick_before, Port, Tick};
use crate::error::SyncError;
use crate::scheduler::Scheduler;
use crate::sync::IrqLock;
use crate::task::TaskHandle;

struct QueueState<T: Copy, const N: usize> {
    buf: [Option<T>; N],
    head: usize,
    len: usize,
    senders: WaitList,
    receivers: WaitList,
}

impl<T: Copy, const N: usize> QueueState<T, N> {
    fn push(&mut self, item: T) -> bool {
        if self.len == N {
            return false;
        }
        self.buf[(self.head + self.len) % N] = Some(item);
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        item
    }
}

pub struct Queue<T: Copy, const N: usize> {
    state: IrqLock<QueueState<T, N>>,
}

/// Ticks left until `deadline`, or `Some(0)` once it has passed.
fn remaining(now: Tick, deadline: Option<Tick>) -> Option<Tick> {
    deadline.map(|d| {
        if tick_before(now, d) {
            d.wrapping_sub(now)
        } else {
            0
        }
    })
}

impl<T: Copy, const N: usize> Queue<T, N> {
    pub const fn new() -> Self {
        Self {
            state: IrqLock::new(QueueState {
                buf: [None; N],
                head: 0,
                len: 0,
                senders: WaitList::new(),
                receivers: WaitList::new(),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_send<P: Port>(&self, sched: &Scheduler<'_, P>, item: T) -> Result<(), SyncError> {
        let mut s = self.state.lock();
        if !s.push(item) {
            return Err(SyncError::Full);
        }
        s.receivers.serve_first(sched);
        Ok(())
    }

    pub fn try_receive<P: Port>(&self, sched: &Scheduler<'_, P>) -> Result<T, SyncError> {
        let mut s = self.state.lock();
        let item = s.pop().ok_or(SyncError::WouldBlock)?;
        s.senders.serve_first(sched);
        Ok(item)
    }

    /// Append `item`, waiting up to `timeout` ticks for space.
    pub fn send<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        item: T,
        timeout: Option<Tick>,
    ) -> Result<(), SyncError> {
        let deadline = super::deadline(sched, timeout);
        loop {
            let me = {
                let mut s = self.state.lock();
                if s.push(item) {
                    s.receivers.serve_first(sched);
                    return Ok(());
                }
                let me = current(sched)?;
                match remaining(sched.port().now(), deadline) {
                    Some(0) if timeout == Some(0) => return Err(SyncError::Full),
                    Some(0) => return Err(SyncError::Timeout),
                    left => park(&mut s.senders, sched, Waiter::new(me), left)?,
                }
                me
            };
            sched.task_resume_current(me);
            self.finish(me, |s| &mut s.senders)?;
        }
    }

    /// Take the oldest item, waiting up to `timeout` ticks for one.
    pub fn receive<P: Port>(
        &self,
        sched: &Scheduler<'_, P>,
        timeout: Option<Tick>,
    ) -> Result<T, SyncError> {
        let deadline = super::deadline(sched, timeout);
        loop {
            let me = {
                let mut s = self.state.lock();
                if let Some(item) = s.pop() {
                    s.senders.serve_first(sched);
                    return Ok(item);
                }
                let me = current(sched)?;
                match remaining(sched.port().now(), deadline) {
                    Some(0) if timeout == Some(0) => return Err(SyncError::WouldBlock),
                    Some(0) => return Err(SyncError::Timeout),
                    left => park(&mut s.receivers, sched, Waiter::new(me), left)?,
                }
                me
            };
            sched.task_resume_current(me);
            self.finish(me, |s| &mut s.receivers)?;
        }
    }

    /// Dequeue `who` after a wait; `Ok` if it was woken to retry.
    fn finish(
        &self,
        who: TaskHandle,
        list: impl FnOnce(&mut QueueState<T, N>) -> &mut WaitList,
    ) -> Result<(), SyncError> {
        let mut s = self.state.lock();
        match list(&mut *s).take(who) {
            Some(w) if w.woken => Ok(()),
            _ => Err(SyncError::Timeout),
        }
    }
}

impl<T: Copy, const N: usize> Default for Queue<T, N> {
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
    fn test_fifo_with_wraparound() {
        let s = fixture();
        let q: Queue<u8, 3> = Queue::new();
        assert_eq!(q.capacity(), 3);
        for i in 0..3 {
            q.try_send(s, i).unwrap();
        }
        assert_eq!(q.try_send(s, 9), Err(SyncError::Full));
        assert_eq!(q.try_receive(s), Ok(0));
        q.try_send(s, 3).unwrap();
        let out: Vec<u8> = (0..3).map(|_| q.try_receive(s).unwrap()).collect();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(q.try_receive(s), Err(SyncError::WouldBlock));
        assert!(q.is_empty());
    }

    #[test]
    fn test_send_wakes_blocked_receiver() {
        let s = fixture();
        let rx = spawn(s, WEIGHT_NORMAL);
        let q: Queue<u32, 2> = Queue::new();
        park(&mut q.state.lock().receivers, s, Waiter::new(rx), None).unwrap();
        assert_eq!(s.task_state(rx), Ok(TaskState::Blocked));

        q.try_send(s, 7).unwrap();
        assert_eq!(s.task_state(rx), Ok(TaskState::Ready));
        assert_eq!(q.finish(rx, |s| &mut s.receivers), Ok(()));
        assert_eq!(q.try_receive(s), Ok(7));
    }

    #[test]
    fn test_receive_wakes_blocked_sender() {
        let s = fixture();
        let tx = spawn(s, WEIGHT_NORMAL);
        let q: Queue<u32, 1> = Queue::new();
        q.try_send(s, 1).unwrap();
        park(&mut q.state.lock().senders, s, Waiter::new(tx), Some(50)).unwrap();
        assert_eq!(s.task_state(tx), Ok(TaskState::Sleeping));

        assert_eq!(q.try_receive(s), Ok(1));
        assert_eq!(s.task_state(tx), Ok(TaskState::Ready));
    }

    #[test]
    fn test_blocking_calls_time_out_on_hosted_port() {
        let s = fixture();
        let a = spawn_on(s, 0, WEIGHT_NORMAL);
        assert_eq!(dispatch(s, 0), Some(a));
        let q: Queue<u16, 1> = Queue::new();
        assert_eq!(q.receive(s, Some(0)), Err(SyncError::WouldBlock));
        assert_eq!(q.receive(s, Some(5)), Err(SyncError::Timeout));
        q.send(s, 11, None).unwrap();
        assert_eq!(q.send(s, 12, Some(0)), Err(SyncError::Full));
        assert_eq!(q.send(s, 12, Some(5)), Err(SyncError::Timeout));
        assert_eq!(q.receive(s, None), Ok(11));
        assert_eq!(s.task_state(a), Ok(TaskState::Running));
    }
}
