//! # Task Control Block
//!
//! Defines the task model for FairOS. Every schedulable unit occupies one
//! slot of the scheduler's fixed pool; the slot stays put for the lifetime
//! of the kernel and is recycled through the free and zombie lists.
//!
//! ## Fairness Model
//!
//! Each task carries a *virtual runtime*: the CPU time it has consumed,
//! scaled down by its weight. The scheduler always runs the ready task with
//! the smallest virtual runtime, so a task of weight `2w` receives twice the
//! CPU of a task of weight `w` over any long enough window.
//!
//! ## List Membership
//!
//! A task sits on at most one intrusive list at a time: the global free
//! list, the global zombie list, or its home core's sleep list. [`Link`]
//! makes the active role explicit so an overlap cannot go unnoticed.

use core::fmt;
use core::num::NonZeroU16;

use crate::arch::{StackPointer, Tick};
use crate::config::{TIME_SLICE_TICKS, VRUNTIME_SCALER};

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task slot.
///
/// ```text
///   Unused ──create──► Ready ◄──────────► Running
///                        ▲                   │
///                        │ unblock / expire  │ block / sleep
///                        │                   ▼
///                        └────────── Blocked / Sleeping
///
///   any live state ──delete / exit──► Zombie ──gc──► Unused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is on the free list.
    Unused,
    /// In its home core's ready heap.
    Ready,
    /// Executing on its home core. Never heap-resident.
    Running,
    /// Waiting without a deadline.
    Blocked,
    /// Waiting with a deadline; on its home core's sleep list.
    Sleeping,
    /// Exited or deleted; stack not yet reclaimed.
    Zombie,
}

impl TaskState {
    /// Live states count against the id space.
    #[inline]
    pub const fn is_live(self) -> bool {
        !matches!(self, TaskState::Unused | TaskState::Zombie)
    }

    /// Waiting for `task_unblock` or a deadline.
    #[inline]
    pub const fn is_waiting(self) -> bool {
        matches!(self, TaskState::Blocked | TaskState::Sleeping)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Numeric task identifier. Always non-zero; reused only after the slot
/// that carried it has been garbage-collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU16);

impl TaskId {
    pub const fn new(raw: u16) -> Option<Self> {
        match NonZeroU16::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed reference to a task: pool slot plus the slot generation and id
/// observed when the handle was issued. A handle to a slot that has since
/// been reclaimed no longer matches and is rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) slot: usize,
    pub(crate) generation: u32,
    pub(crate) id: TaskId,
}

impl TaskHandle {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

// ---------------------------------------------------------------------------
// Intrusive list link
// ---------------------------------------------------------------------------

/// The one list a task slot may be threaded through, with the next slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    None,
    Free(Option<usize>),
    Zombie(Option<usize>),
    Sleep(Option<usize>),
}

// ---------------------------------------------------------------------------
// Stack memory
// ---------------------------------------------------------------------------

/// Stack memory of a task. `owned` is set when the scheduler allocated it
/// from the heap.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub base: *mut u8,
    pub len: usize,
    pub owned: bool,
}

impl StackRegion {
    pub const EMPTY: StackRegion = StackRegion {
        base: core::ptr::null_mut(),
        len: 0,
        owned: false,
    };

    /// Exclusive top of the stack; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.base.wrapping_add(self.len)
    }

    /// Location of the overflow canary: the lowest word.
    #[inline]
    pub fn canary(&self) -> *mut u32 {
        self.base as *mut u32
    }
}

// ---------------------------------------------------------------------------
// Virtual runtime arithmetic
// ---------------------------------------------------------------------------

/// `a` is strictly less than `b` modulo 2^64.
#[inline]
pub const fn vruntime_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// The later of two virtual runtimes, modulo 2^64.
#[inline]
pub const fn vruntime_max(a: u64, b: u64) -> u64 {
    if vruntime_before(a, b) {
        b
    } else {
        a
    }
}

/// Virtual runtime owed for `ticks` of CPU at `weight`. At least one tick
/// is always charged so a zero-length run still costs something.
#[inline]
pub fn vruntime_charge(ticks: u32, weight: u32) -> u64 {
    let ticks = ticks.max(1) as u64;
    (ticks * VRUNTIME_SCALER / weight.max(1) as u64).max(1)
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task control block, one per pool slot.
pub struct Task {
    /// Saved stack pointer, written by the context-switch trap.
    pub sp: StackPointer,
    pub stack: StackRegion,
    pub state: TaskState,
    pub vruntime: u64,
    /// Ticks left before the running task is asked to yield.
    pub slice_left: u32,
    /// Tick at which the task was last dispatched.
    pub run_start: Tick,
    /// Effective weight, possibly boosted by priority inheritance.
    pub weight: u32,
    /// Nominal weight restored when inheritance ends.
    pub base_weight: u32,
    pub id: Option<TaskId>,
    /// Id still reserved by a zombie until the collector releases it.
    pub retired_id: Option<TaskId>,
    /// Bumped whenever the slot returns to the free list.
    pub generation: u32,
    /// Position in the home core's ready heap while `Ready`.
    pub heap_index: Option<usize>,
    pub link: Link,
    /// Deadline while `Sleeping`.
    pub wake_at: Tick,
    pub notify_value: u32,
    pub notify_pending: bool,
    pub notify_waiting: bool,
    /// Bits an event-group wait is interested in; zero when not waiting.
    pub event_mask: u32,
    pub event_wait_all: bool,
    /// Home core.
    pub core: usize,
    pub is_idle: bool,
}

// Safety: a Task's raw pointers refer to its own stack region, and tasks
// are only touched under the scheduler's locks.
unsafe impl Send for Task {}

impl Task {
    /// An unused slot.
    pub const EMPTY: Task = Task {
        sp: StackPointer::NULL,
        stack: StackRegion::EMPTY,
        state: TaskState::Unused,
        vruntime: 0,
        slice_left: 0,
        run_start: 0,
        weight: 0,
        base_weight: 0,
        id: None,
        retired_id: None,
        generation: 0,
        heap_index: None,
        link: Link::None,
        wake_at: 0,
        notify_value: 0,
        notify_pending: false,
        notify_waiting: false,
        event_mask: 0,
        event_wait_all: false,
        core: 0,
        is_idle: false,
    };

    /// Fill a freshly popped slot for a new task. The slot keeps its
    /// generation; the caller inserts it into a ready heap afterwards.
    pub fn init(&mut self, id: TaskId, stack: StackRegion, weight: u32, core: usize) {
        let generation = self.generation;
        *self = Task::EMPTY;
        self.generation = generation;
        self.id = Some(id);
        self.stack = stack;
        self.weight = weight;
        self.base_weight = weight;
        self.core = core;
        self.slice_left = TIME_SLICE_TICKS;
    }

    /// Return the slot to its pristine state, retiring the old generation.
    pub fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Task::EMPTY;
        self.generation = generation;
    }

    #[inline]
    pub fn matches(&self, handle: &TaskHandle) -> bool {
        self.generation == handle.generation && self.id == Some(handle.id)
    }

    /// Charge `ticks` of CPU time to the virtual runtime.
    #[inline]
    pub fn charge(&mut self, ticks: u32) {
        self.vruntime = self.vruntime.wrapping_add(vruntime_charge(ticks, self.weight));
    }

    /// Write the overflow canary at the bottom of the stack.
    ///
    /// # Safety
    /// The stack region must be valid and at least one word long.
    pub unsafe fn arm_canary(&self, value: u32) {
        unsafe { self.stack.canary().write_volatile(value) }
    }

    /// Whether the canary still reads `value`.
    ///
    /// # Safety
    /// As for [`Task::arm_canary`].
    pub unsafe fn canary_intact(&self, value: u32) -> bool {
        unsafe { self.stack.canary().read_volatile() == value }
    }

    /// Take any pending notification, clearing it.
    pub fn take_notification(&mut self) -> Option<u32> {
        if !self.notify_pending {
            return None;
        }
        self.notify_pending = false;
        Some(core::mem::take(&mut self.notify_value))
    }
}

/// Diagnostic snapshot of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub state: TaskState,
    pub weight: u32,
    pub base_weight: u32,
    pub vruntime: u64,
    pub core: usize,
    pub stack_size: usize,
    pub static_stack: bool,
    pub is_idle: bool,
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WEIGHT_HIGH, WEIGHT_LOW, WEIGHT_NORMAL};

    fn id(n: u16) -> TaskId {
        TaskId::new(n).unwrap()
    }

    #[test]
    fn test_tcb_initialization() {
        let mut tcb = Task::EMPTY;
        assert_eq!(tcb.state, TaskState::Unused);
        tcb.generation = 7;

        tcb.init(id(3), StackRegion::EMPTY, WEIGHT_NORMAL, 1);
        assert_eq!(tcb.id, Some(id(3)));
        assert_eq!(tcb.generation, 7);
        assert_eq!(tcb.weight, WEIGHT_NORMAL);
        assert_eq!(tcb.base_weight, WEIGHT_NORMAL);
        assert_eq!(tcb.core, 1);
        assert_eq!(tcb.slice_left, TIME_SLICE_TICKS);
        assert_eq!(tcb.heap_index, None);
        assert_eq!(tcb.link, Link::None);
    }

    #[test]
    fn test_reset_retires_generation() {
        let mut tcb = Task::EMPTY;
        tcb.init(id(1), StackRegion::EMPTY, WEIGHT_NORMAL, 0);
        let handle = TaskHandle { slot: 0, generation: tcb.generation, id: id(1) };
        assert!(tcb.matches(&handle));
        tcb.reset();
        assert!(!tcb.matches(&handle));
        assert_eq!(tcb.id, None);
    }

    #[test]
    fn test_charge_scales_with_weight() {
        let mut low = Task::EMPTY;
        let mut high = Task::EMPTY;
        low.init(id(1), StackRegion::EMPTY, WEIGHT_LOW, 0);
        high.init(id(2), StackRegion::EMPTY, WEIGHT_HIGH, 0);
        low.charge(10);
        high.charge(10);
        assert_eq!(low.vruntime, 10 * VRUNTIME_SCALER / WEIGHT_LOW as u64);
        assert_eq!(high.vruntime, 10 * VRUNTIME_SCALER / WEIGHT_HIGH as u64);
        assert!(high.vruntime < low.vruntime);
    }

    #[test]
    fn test_zero_tick_run_still_charged() {
        assert!(vruntime_charge(0, WEIGHT_NORMAL) >= 1);
        assert!(vruntime_charge(0, u32::MAX) >= 1);
    }

    #[test]
    fn test_vruntime_comparison_wraps() {
        assert!(vruntime_before(u64::MAX - 1, 5));
        assert!(!vruntime_before(5, u64::MAX - 1));
        assert_eq!(vruntime_max(u64::MAX, 2), 2);
        assert_eq!(vruntime_max(2, 1), 2);
    }

    #[test]
    fn test_notification_take_clears() {
        let mut tcb = Task::EMPTY;
        assert_eq!(tcb.take_notification(), None);
        tcb.notify_value = 0b101;
        tcb.notify_pending = true;
        assert_eq!(tcb.take_notification(), Some(0b101));
        assert_eq!(tcb.take_notification(), None);
        assert_eq!(tcb.notify_value, 0);
    }

    #[test]
    fn test_live_states() {
        assert!(TaskState::Ready.is_live());
        assert!(TaskState::Sleeping.is_live());
        assert!(!TaskState::Zombie.is_live());
        assert!(!TaskState::Unused.is_live());
        assert!(TaskState::Blocked.is_waiting());
        assert!(!TaskState::Running.is_waiting());
    }
}
