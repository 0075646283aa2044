//! # Kernel
//!
//! Global kernel instance and the application-facing API for FairOS on
//! bare metal.
//!
//! The kernel owns the memory pool used for task stacks and the global
//! scheduler. The exception handlers in `arch::cortex_m4` reach the
//! scheduler through [`tick`], [`save_context`] and [`next_context`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init(pool)    ← Hand over the heap pool
//!         ├─► kernel::create_task() ← Register tasks (×N)
//!         └─► kernel::start()       ← Launch scheduler (no return)
//!               ├─► Configure SysTick
//!               ├─► Set interrupt priorities
//!               ├─► Create the idle task
//!               └─► Start first task via arch::start_first_task()
//! ```

use core::ffi::c_void;

use crate::arch::cortex_m4::{self, CortexM4};
use crate::arch::{Port, StackPointer, TaskEntry, Tick};
use crate::error::{HeapError, TaskError};
use crate::heap::{Heap, HeapStats};
use crate::scheduler::Scheduler;
use crate::task::{TaskHandle, TaskId};

static HEAP: Heap = Heap::new();

/// Global scheduler instance.
pub static SCHEDULER: Scheduler<'static, CortexM4> = Scheduler::new(&HEAP, CortexM4, exit_trampoline);

/// Where a task's entry function returns to.
extern "C" fn exit_trampoline() -> ! {
    SCHEDULER.task_exit()
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Initialize the kernel with `pool` as the task stack heap.
///
/// Must be called once, before any other kernel function.
pub fn init(pool: &'static mut [u8]) -> Result<(), HeapError> {
    HEAP.init_static(pool)?;
    SCHEDULER.init();
    log::debug!("kernel: heap {} bytes", HEAP.stats().total);
    Ok(())
}

/// Create a task with a heap-allocated stack.
///
/// # Example
/// ```ignore
/// extern "C" fn blink(_: *mut c_void) { loop { kernel::sleep(500); } }
/// kernel::create_task(blink, core::ptr::null_mut(), 1024, WEIGHT_NORMAL)?;
/// ```
pub fn create_task(
    entry: TaskEntry,
    arg: *mut c_void,
    stack_bytes: usize,
    weight: u32,
) -> Result<TaskHandle, TaskError> {
    SCHEDULER.task_create(entry, arg, stack_bytes, weight)
}

/// Create a task on a caller-owned stack buffer outside the heap.
pub fn create_task_static(
    entry: TaskEntry,
    arg: *mut c_void,
    stack: &'static mut [u8],
    weight: u32,
) -> Result<TaskHandle, TaskError> {
    SCHEDULER.task_create_static(entry, arg, stack, weight)
}

pub fn delete_task(id: TaskId) -> Result<(), TaskError> {
    SCHEDULER.task_delete(id)
}

/// Terminate the calling task.
pub fn exit() -> ! {
    SCHEDULER.task_exit()
}

pub fn yield_now() {
    SCHEDULER.task_yield();
}

/// Sleep the calling task for `ticks` scheduler ticks.
pub fn sleep(ticks: Tick) -> Result<(), TaskError> {
    SCHEDULER.task_sleep_ticks(ticks)
}

pub fn notify(task: TaskHandle, value: u32) -> Result<(), TaskError> {
    SCHEDULER.task_notify(task, value)
}

/// Wait for a notification; `None` waits forever.
pub fn notify_wait(timeout: Option<Tick>) -> Result<Option<u32>, TaskError> {
    SCHEDULER.task_notify_wait(timeout)
}

pub fn heap_stats() -> HeapStats {
    HEAP.stats()
}

pub fn ticks() -> Tick {
    SCHEDULER.port().now()
}

/// Start the scheduler. **Does not return.**
///
/// Configures SysTick and the handler priorities, creates the idle task
/// and launches the first task.
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities(&mut core_peripherals.SCB);

    if let Err(e) = SCHEDULER.start_core(0) {
        log::error!("kernel: idle task creation failed: {}", e);
        SCHEDULER.port().halt("no idle task");
    }
    let first = cortex_m::interrupt::free(|_| SCHEDULER.schedule_next_task());
    // Safety: `first` was built by `CortexM4::initialize_stack` and this is
    // the only launch.
    unsafe { cortex_m4::start_first_task(first) }
}

// ---------------------------------------------------------------------------
// Exception hooks
// ---------------------------------------------------------------------------

pub(crate) fn tick() {
    if SCHEDULER.scheduler_tick() {
        SCHEDULER.port().request_context_switch();
    }
}

pub(crate) fn save_context(sp: StackPointer) {
    SCHEDULER.save_context(sp);
}

pub(crate) fn next_context() -> StackPointer {
    SCHEDULER.schedule_next_task()
}
