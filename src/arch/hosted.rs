//! # Hosted Port
//!
//! A native stand-in for the CPU port, used by unit tests and by the
//! simulation binary. There is no real register context here: the
//! "context switch" is a counter the caller inspects, the tick counter is
//! advanced explicitly, and the current core is whatever the test says it
//! is. `halt` becomes a Rust panic so fatal paths can be tested with
//! `#[should_panic]`.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{Port, StackPointer, TaskEntry, TaskExit, Tick};

/// Words of the fake frame pushed by [`HostedPort::initialize_stack`].
pub const FRAME_WORDS: usize = 4;

/// Marker written at the bottom of the fake frame.
pub const FRAME_MAGIC: usize = 0x5EED_F00D;

pub struct HostedPort {
    tick: AtomicU32,
    core: AtomicUsize,
    switch_requests: AtomicUsize,
    idle_waits: AtomicUsize,
}

impl HostedPort {
    pub const fn new() -> Self {
        Self {
            tick: AtomicU32::new(0),
            core: AtomicUsize::new(0),
            switch_requests: AtomicUsize::new(0),
            idle_waits: AtomicUsize::new(0),
        }
    }

    /// Move the tick counter forward by `ticks`.
    pub fn advance(&self, ticks: Tick) {
        self.tick.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set_tick(&self, tick: Tick) {
        self.tick.store(tick, Ordering::SeqCst);
    }

    /// Pretend subsequent calls run on `core`.
    pub fn set_core(&self, core: usize) {
        self.core.store(core, Ordering::SeqCst);
    }

    pub fn switch_requests(&self) -> usize {
        self.switch_requests.load(Ordering::SeqCst)
    }

    pub fn idle_waits(&self) -> usize {
        self.idle_waits.load(Ordering::SeqCst)
    }

    /// Decode a frame built by `initialize_stack`.
    ///
    /// # Safety
    /// `sp` must have been returned by `initialize_stack` on a stack that
    /// is still allocated.
    pub unsafe fn read_frame(sp: StackPointer) -> Option<(usize, usize, usize)> {
        let words = sp.0 as *const usize;
        if unsafe { *words } != FRAME_MAGIC {
            return None;
        }
        unsafe { Some((*words.add(1), *words.add(2), *words.add(3))) }
    }
}

impl Default for HostedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostedPort {
    unsafe fn initialize_stack(
        &self,
        top: *mut u8,
        entry: TaskEntry,
        arg: *mut c_void,
        exit: TaskExit,
    ) -> StackPointer {
        let frame = unsafe { (top as *mut usize).sub(FRAME_WORDS) };
        unsafe {
            frame.write(FRAME_MAGIC);
            frame.add(1).write(entry as usize);
            frame.add(2).write(arg as usize);
            frame.add(3).write(exit as usize);
        }
        StackPointer(frame as *mut u32)
    }

    fn request_context_switch(&self) {
        self.switch_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn core_id(&self) -> usize {
        self.core.load(Ordering::SeqCst)
    }

    fn now(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    fn idle_wait(&self) {
        self.idle_waits.fetch_add(1, Ordering::SeqCst);
        core::hint::spin_loop();
    }

    fn halt(&self, reason: &str) -> ! {
        panic!("kernel halted: {}", reason)
    }
}
