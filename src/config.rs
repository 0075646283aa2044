//! # FairOS Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All limits are fixed at compile time; the task pool never grows.

use static_assertions::const_assert;

/// Maximum number of task slots in the global pool, idle tasks included.
/// Live task identifiers are tracked in a `u32` bitmap, so this must not
/// exceed 32.
pub const MAX_TASKS: usize = 16;

/// Number of processor cores. Each core owns one ready heap, one sleep
/// list and one idle task. Tasks are pinned round-robin at creation.
pub const MAX_CORES: usize = 2;

/// SysTick frequency in Hz. Determines scheduler tick granularity.
pub const TICK_HZ: u32 = 1000;

/// Time slice in ticks. The running task is asked to yield once it has
/// consumed this many ticks without blocking.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Smallest stack accepted by `task_create`. Must hold the initial
/// exception frame plus the software-saved registers with room to spare.
pub const MIN_STACK_SIZE: usize = 256;

/// Largest stack accepted by `task_create`.
pub const MAX_STACK_SIZE: usize = 16 * 1024;

/// Stack alignment required by the AAPCS at public interfaces.
pub const STACK_ALIGN: usize = 8;

/// Stack size of the per-core idle task.
pub const IDLE_STACK_SIZE: usize = 512;

/// Word written at the lowest address of every task stack. The idle task
/// compares it on each pass to detect overflow.
pub const STACK_CANARY: u32 = 0xDEAD_BEEF;

/// Fixed-point scale applied when converting consumed ticks into virtual
/// runtime: `delta = ticks * VRUNTIME_SCALER / weight`.
pub const VRUNTIME_SCALER: u64 = 1024;

/// Weight of background work.
pub const WEIGHT_LOW: u32 = 256;

/// Default weight. A task at this weight accrues exactly one tick of
/// virtual runtime per tick of CPU time.
pub const WEIGHT_NORMAL: u32 = 1024;

/// Weight of latency-sensitive work.
pub const WEIGHT_HIGH: u32 = 4096;

/// Weight given to idle tasks. Idle tasks never enter a ready heap so the
/// value only matters for diagnostics.
pub const WEIGHT_IDLE: u32 = 1;

/// Size of the statically reserved pool handed to the allocator by the
/// bare-metal kernel.
pub const HEAP_SIZE: usize = 32 * 1024;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

const_assert!(MAX_TASKS >= 1 && MAX_TASKS <= 32);
const_assert!(MAX_CORES >= 1);
const_assert!(MAX_TASKS >= MAX_CORES);
const_assert!(STACK_ALIGN.is_power_of_two());
const_assert!(MIN_STACK_SIZE <= IDLE_STACK_SIZE && IDLE_STACK_SIZE <= MAX_STACK_SIZE);
const_assert!(WEIGHT_IDLE >= 1);
