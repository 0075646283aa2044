//! # Error Types
//!
//! Every recoverable failure in the kernel is reported as one of the enums
//! below. Each variant maps to a stable negative code through `code()`, so a
//! shell or a C caller can tell failure classes apart without matching on
//! the Rust type.

use thiserror::Error;

/// Failures of task lifecycle and scheduler primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("stack size {0} outside the configured limits")]
    InvalidStackSize(usize),

    #[error("no free task slot")]
    NoFreeSlot,

    #[error("stack allocation of {0} bytes failed")]
    OutOfMemory(usize),

    #[error("task id space exhausted")]
    IdsExhausted,

    #[error("no task with that id")]
    NotFound,

    #[error("operation not permitted on an idle task")]
    IdleTask,

    #[error("task handle refers to a reclaimed slot")]
    StaleHandle,

    #[error("static stack lies inside the managed heap")]
    StackInHeap,

    #[error("task weight must be non-zero")]
    InvalidWeight,

    #[error("task is not in a state that allows this transition")]
    InvalidState,
}

impl TaskError {
    pub const fn code(&self) -> i32 {
        match self {
            TaskError::InvalidStackSize(_) => -1,
            TaskError::NoFreeSlot => -2,
            TaskError::OutOfMemory(_) => -3,
            TaskError::IdsExhausted => -4,
            TaskError::NotFound => -5,
            TaskError::IdleTask => -6,
            TaskError::StaleHandle => -7,
            TaskError::StackInHeap => -8,
            TaskError::InvalidWeight => -9,
            TaskError::InvalidState => -10,
        }
    }
}

/// Usage errors reported by `Heap::free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("null pointer")]
    NullPointer,

    #[error("pointer outside the managed pool")]
    OutOfRange,

    #[error("pointer does not refer to an allocated block")]
    NotAllocated,

    #[error("allocator not initialized")]
    Uninitialized,
}

impl HeapError {
    pub const fn code(&self) -> i32 {
        match self {
            HeapError::NullPointer => -1,
            HeapError::OutOfRange => -2,
            HeapError::NotAllocated => -3,
            HeapError::Uninitialized => -4,
        }
    }
}

/// Structural corruption found by `Heap::check_integrity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("allocator not initialized")]
    Uninitialized,

    #[error("block header at {0:#x} is misaligned")]
    MisalignedHeader(usize),

    #[error("block at {0:#x} extends past the pool end")]
    BlockOutOfBounds(usize),

    #[error("block at {0:#x} has a broken physical back-link")]
    BrokenBackLink(usize),

    #[error("blocks at {0:#x} and its successor are both free")]
    AdjacentFree(usize),

    #[error("bitmap disagrees with free list ({0}, {1})")]
    BitmapMismatch(usize, usize),

    #[error("free block at {0:#x} is filed in the wrong bucket")]
    WrongBucket(usize),

    #[error("free-list pointer {0:#x} points outside the pool")]
    FreeLinkOutOfBounds(usize),

    #[error("free-list links around {0:#x} are inconsistent")]
    FreeLinkMismatch(usize),

    #[error("block at {0:#x} is on a free list but not marked free")]
    NotMarkedFree(usize),

    #[error("physical and logical walks disagree with the counters")]
    CounterMismatch,

    #[error("block at {0:#x} is smaller than the minimum block")]
    UndersizedBlock(usize),
}

impl IntegrityError {
    pub const fn code(&self) -> i32 {
        match self {
            IntegrityError::Uninitialized => -1,
            IntegrityError::MisalignedHeader(_) => -2,
            IntegrityError::BlockOutOfBounds(_) => -3,
            IntegrityError::BrokenBackLink(_) => -4,
            IntegrityError::AdjacentFree(_) => -5,
            IntegrityError::BitmapMismatch(..) => -6,
            IntegrityError::WrongBucket(_) => -7,
            IntegrityError::FreeLinkOutOfBounds(_) => -8,
            IntegrityError::FreeLinkMismatch(_) => -9,
            IntegrityError::NotMarkedFree(_) => -10,
            IntegrityError::CounterMismatch => -11,
            IntegrityError::UndersizedBlock(_) => -12,
        }
    }
}

/// Failures of the blocking primitives built on the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("wait timed out")]
    Timeout,

    #[error("caller does not own the mutex")]
    NotOwner,

    #[error("resource unavailable and no wait requested")]
    WouldBlock,

    #[error("wait list is full")]
    Full,

    #[error("no task is running on this core")]
    NoCurrentTask,

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl SyncError {
    pub const fn code(&self) -> i32 {
        match self {
            SyncError::Timeout => -1,
            SyncError::NotOwner => -2,
            SyncError::WouldBlock => -3,
            SyncError::Full => -4,
            SyncError::NoCurrentTask => -5,
            SyncError::Task(e) => -100 + e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_codes_are_distinct_and_negative() {
        let all = [
            TaskError::InvalidStackSize(0),
            TaskError::NoFreeSlot,
            TaskError::OutOfMemory(0),
            TaskError::IdsExhausted,
            TaskError::NotFound,
            TaskError::IdleTask,
            TaskError::StaleHandle,
            TaskError::StackInHeap,
            TaskError::InvalidWeight,
            TaskError::InvalidState,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_sync_error_wraps_task_error() {
        let e: SyncError = TaskError::StaleHandle.into();
        assert_eq!(e, SyncError::Task(TaskError::StaleHandle));
        assert_eq!(e.code(), -107);
    }
}
