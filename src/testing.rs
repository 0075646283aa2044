//! Shared fixtures for the host unit tests.

use core::ffi::c_void;

use crate::arch::hosted::HostedPort;
use crate::config::MIN_STACK_SIZE;
use crate::heap::Heap;
use crate::scheduler::Scheduler;
use crate::task::TaskHandle;

pub type TestScheduler = Scheduler<'static, HostedPort>;

pub extern "C" fn noop(_: *mut c_void) {}

pub extern "C" fn never_exit() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// A heap over a leaked, 8-byte aligned pool of `size` bytes.
pub fn leak_heap(size: usize) -> &'static Heap {
    let pool: &'static mut [u64] = Box::leak(vec![0u64; size / 8].into_boxed_slice());
    let heap: &'static Heap = Box::leak(Box::new(Heap::new()));
    unsafe { heap.init(pool.as_mut_ptr() as *mut u8, size).unwrap() };
    heap
}

pub fn fixture_with_heap(size: usize) -> &'static TestScheduler {
    let sched = Box::leak(Box::new(Scheduler::new(
        leak_heap(size),
        HostedPort::new(),
        never_exit,
    )));
    sched.init();
    sched
}

pub fn fixture() -> &'static TestScheduler {
    fixture_with_heap(64 * 1024)
}

pub fn spawn(s: &TestScheduler, weight: u32) -> TaskHandle {
    s.task_create(noop, core::ptr::null_mut(), MIN_STACK_SIZE, weight)
        .unwrap()
}

/// Create tasks until one lands on `core`; the others stay ready elsewhere.
pub fn spawn_on(s: &TestScheduler, core: usize, weight: u32) -> TaskHandle {
    loop {
        let h = spawn(s, weight);
        if s.task_info(h).unwrap().core == core {
            return h;
        }
    }
}

/// Dispatch on `core` and return what runs there.
pub fn dispatch(s: &TestScheduler, core: usize) -> Option<TaskHandle> {
    s.port().set_core(core);
    s.schedule_next_task();
    s.current_task()
}
