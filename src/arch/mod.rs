//! # Architecture Abstraction Layer
//!
//! Provides a hardware abstraction boundary for the scheduler. The kernel
//! never touches registers directly: everything it needs from the CPU and
//! the board goes through [`Port`].
//!
//! - [`cortex_m4`]: the bare-metal port (PendSV / SysTick).
//! - [`hosted`]: a native mock used for tests and simulation.

use core::ffi::c_void;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(not(target_os = "none"))]
pub mod hosted;

/// Kernel tick counter. Wraps; compare with [`tick_before`].
pub type Tick = u32;

/// Task entry point. Receives the `arg` given at creation.
pub type TaskEntry = extern "C" fn(arg: *mut c_void);

/// Where a task lands if its entry function returns.
pub type TaskExit = extern "C" fn() -> !;

/// Saved context of a suspended task: the top of its stack after the
/// architecture layer pushed its register frame. Opaque to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct StackPointer(pub *mut u32);

impl StackPointer {
    pub const NULL: StackPointer = StackPointer(core::ptr::null_mut());
}

/// `a` is strictly earlier than `b`, modulo counter wraparound.
#[inline]
pub const fn tick_before(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Services the scheduler consumes from the CPU port and the platform.
pub trait Port: Sync + 'static {
    /// Build the initial register frame for a new task below `top` so that
    /// the first switch to it calls `entry(arg)` and a return from `entry`
    /// lands in `exit`.
    ///
    /// # Safety
    /// `top` must be the aligned, exclusive end of a writable stack region
    /// large enough for the frame.
    unsafe fn initialize_stack(
        &self,
        top: *mut u8,
        entry: TaskEntry,
        arg: *mut c_void,
        exit: TaskExit,
    ) -> StackPointer;

    /// Ask for a context switch on the calling core as soon as interrupts
    /// allow it.
    fn request_context_switch(&self);

    /// Index of the calling core, `< MAX_CORES`.
    fn core_id(&self) -> usize;

    /// Cores that actually run tasks. New tasks are spread over
    /// `0..core_count()` round-robin.
    fn core_count(&self) -> usize {
        crate::config::MAX_CORES
    }

    /// Monotonic tick counter.
    fn now(&self) -> Tick;

    /// Low-power wait used by idle tasks.
    fn idle_wait(&self);

    /// Stop the system. Must leave a diagnosable signal.
    fn halt(&self, reason: &str) -> !;
}
