//! # FairOS Demo
//!
//! Four tasks with different weights and behaviors share the CPU:
//!
//! | Task | Weight | Behavior |
//! |------|--------|----------|
//! | `cruncher` | LOW | Busy-loops, never yields |
//! | `sampler` | NORMAL | Works, then sleeps 100 ticks |
//! | `consumer` | NORMAL | Blocks on a notification from `producer` |
//! | `producer` | HIGH | Short bursts, notifies `consumer` |
//!
//! ## Expected Behavior
//!
//! - `cruncher` soaks up whatever CPU is left but cannot starve the others:
//!   its virtual runtime grows four times faster than a NORMAL task's.
//! - `sampler` wakes on time; its virtual runtime is lifted to the current
//!   minimum, so sleeping buys it no extra credit.
//! - `producer` runs about four times as often as a NORMAL task when all
//!   are busy.
//!
//! On bare metal this is the firmware image. On a hosted target the same
//! mix is simulated tick by tick against the hosted port and the CPU share
//! of each task is printed.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::ffi::c_void;
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use fairos::config::{HEAP_SIZE, WEIGHT_HIGH, WEIGHT_LOW, WEIGHT_NORMAL};
    use fairos::kernel;
    use fairos::task::TaskHandle;

    static mut POOL: [u8; HEAP_SIZE] = [0; HEAP_SIZE];
    static CONSUMER: AtomicU32 = AtomicU32::new(0);
    static mut CONSUMER_HANDLE: Option<TaskHandle> = None;

    /// CPU hog: only ever preempted.
    extern "C" fn cruncher(_: *mut c_void) {
        let mut counter: u32 = 0;
        loop {
            counter = counter.wrapping_add(1);
            core::hint::black_box(counter);
        }
    }

    /// Periodic sampler: ~5 ticks of work every 100 ticks.
    extern "C" fn sampler(_: *mut c_void) {
        loop {
            let mut work: u32 = 0;
            for _ in 0..5000 {
                work = core::hint::black_box(work.wrapping_add(1));
            }
            let _ = kernel::sleep(100);
        }
    }

    extern "C" fn consumer(_: *mut c_void) {
        loop {
            if let Ok(Some(bits)) = kernel::notify_wait(None) {
                CONSUMER.fetch_add(bits, Ordering::Relaxed);
            }
        }
    }

    extern "C" fn producer(_: *mut c_void) {
        loop {
            let mut result: u32 = 0;
            for _ in 0..2000 {
                result = core::hint::black_box(result.wrapping_add(1));
            }
            // Safety: written once in `main` before the scheduler starts.
            if let Some(h) = unsafe { CONSUMER_HANDLE } {
                let _ = kernel::notify(h, 1);
            }
            kernel::yield_now();
        }
    }

    #[entry]
    fn main() -> ! {
        let Some(cp) = cortex_m::Peripherals::take() else {
            loop {
                cortex_m::asm::wfi();
            }
        };

        // Safety: the pool is handed to the kernel exactly once.
        let pool = unsafe { &mut *core::ptr::addr_of_mut!(POOL) };
        if kernel::init(pool).is_err() {
            loop {
                cortex_m::asm::wfi();
            }
        }

        let null = core::ptr::null_mut();
        let _ = kernel::create_task(cruncher, null, 512, WEIGHT_LOW);
        let _ = kernel::create_task(sampler, null, 1024, WEIGHT_NORMAL);
        if let Ok(h) = kernel::create_task(consumer, null, 1024, WEIGHT_NORMAL) {
            // Safety: no task is running yet.
            unsafe { CONSUMER_HANDLE = Some(h) };
        }
        let _ = kernel::create_task(producer, null, 1024, WEIGHT_HIGH);

        kernel::start(cp)
    }
}

#[cfg(not(target_os = "none"))]
mod simulation {
    use std::error::Error;
    use std::ffi::c_void;
    use fairos::arch::Port;

    use fairos::arch::hosted::HostedPort;
    use fairos::config::{HEAP_SIZE, MAX_CORES, MAX_TASKS, WEIGHT_HIGH, WEIGHT_LOW, WEIGHT_NORMAL};
    use fairos::heap::Heap;
    use fairos::scheduler::Scheduler;

    const SIM_TICKS: u32 = 2_000;

    extern "C" fn body(_: *mut c_void) {}

    extern "C" fn exit_trap() -> ! {
        panic!("simulated task returned");
    }

    pub fn run() -> Result<(), Box<dyn Error>> {
        let pool: &'static mut [u64] = Box::leak(vec![0u64; HEAP_SIZE / 8].into_boxed_slice());
        let heap: &'static Heap = Box::leak(Box::new(Heap::new()));
        // Safety: the pool is leaked and used by nothing else.
        unsafe { heap.init(pool.as_mut_ptr() as *mut u8, HEAP_SIZE)? };
        let sched: &'static Scheduler<'static, HostedPort> =
            Box::leak(Box::new(Scheduler::new(heap, HostedPort::new(), exit_trap)));
        sched.init();
        for core in 0..MAX_CORES {
            sched.start_core(core)?;
        }

        let mix = [
            ("cruncher", WEIGHT_LOW),
            ("sampler", WEIGHT_NORMAL),
            ("worker", WEIGHT_NORMAL),
            ("producer", WEIGHT_HIGH),
            ("batch", WEIGHT_LOW),
            ("control", WEIGHT_HIGH),
        ];
        let mut names = [""; MAX_TASKS];
        let mut handles = Vec::new();
        for (name, weight) in mix {
            let h = sched.task_create(body, std::ptr::null_mut(), 1024, weight)?;
            names[h.slot()] = name;
            handles.push(h);
        }
        let sampler = handles[1];

        let port = sched.port();
        for core in 0..MAX_CORES {
            port.set_core(core);
            sched.schedule_next_task();
        }

        let mut share = [0u32; MAX_TASKS];
        for _ in 0..SIM_TICKS {
            port.advance(1);
            for core in 0..MAX_CORES {
                port.set_core(core);
                if let Some(cur) = sched.current_task() {
                    share[cur.slot()] += 1;
                    // The sampler works one slice, then sleeps 100 ticks.
                    if cur == sampler && port.now() % 110 == 10 {
                        sched.task_block(sampler, Some(port.now() + 100))?;
                        sched.schedule_next_task();
                        continue;
                    }
                }
                if sched.scheduler_tick() {
                    sched.schedule_next_task();
                }
            }
        }

        println!("{:<10} {:>6} {:>6} {:>8}", "task", "core", "weight", "ticks");
        for i in 0..MAX_TASKS {
            let Some(info) = sched.scheduler_get_task_by_index(i) else {
                continue;
            };
            let name = if info.is_idle { "idle" } else { names[i] };
            println!(
                "{:<10} {:>6} {:>6} {:>8}",
                name, info.core, info.weight, share[i]
            );
        }
        for core in 0..MAX_CORES {
            println!("core {} context switches: {}", core, sched.context_switches(core));
        }

        let stats = heap.stats();
        println!(
            "heap: {} used / {} total, largest free {}, {} fragments",
            stats.used, stats.total, stats.largest_free, stats.fragments
        );
        heap.check_integrity()?;
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    simulation::run()
}
