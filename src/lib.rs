//! # FairOS
//!
//! A weighted-fair preemptive RTOS kernel for single- and multi-core
//! microcontrollers, with a bare-metal ARM Cortex-M4 port and a hosted port
//! for tests and simulation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · create_task · sleep · notify · start · exit   │
//! ├──────────────────────────┬─────────────────────────────┤
//! │  Scheduler               │  Primitives                 │
//! │  scheduler.rs            │  primitives/                │
//! │  ─ ready_heap.rs         │  ─ Mutex (inheritance)      │
//! │  ─ sleep_list.rs         │  ─ Semaphore · EventGroup   │
//! │  ─ task.rs               │  ─ Queue                    │
//! ├──────────────────────────┴─────────────────────────────┤
//! │   Heap (heap.rs)  · IrqLock (sync.rs) · config.rs      │
//! ├────────────────────────────────────────────────────────┤
//! │     Port trait (arch/)  ─ cortex_m4 · hosted           │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! Every task carries a weight and a virtual runtime. Running for `t` ticks
//! advances virtual runtime by `t * 1024 / weight`; each core always runs
//! the ready task with the smallest virtual runtime. CPU time therefore
//! splits in proportion to weight, and a task that sleeps is lifted to the
//! current minimum on wake-up so it cannot bank credit.
//!
//! ## Memory Model
//!
//! - **Fixed task pool**: `MAX_TASKS` slots, recycled through a free list
//! - **Stacks from a TLSF heap**: O(1) allocate and free with coalescing,
//!   or caller-supplied static buffers
//! - **Deferred reclamation**: deleted tasks become zombies and are freed
//!   by the idle task
//! - **Interrupt-safe locks**: `critical-section` plus a spinlock per core

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod heap;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod kernel;
pub mod primitives;
pub mod ready_heap;
pub mod scheduler;
pub mod sleep_list;
pub mod sync;
pub mod task;

#[cfg(test)]
mod testing;
