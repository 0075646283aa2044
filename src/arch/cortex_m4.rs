//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements [`Port`] for a single core, context switching via PendSV,
//! SysTick timer configuration, and interrupt management.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler manually saves and
//! restores R4–R11, which completes the full context save/restore.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest), so a switch never preempts an ISR

use core::arch::{asm, naked_asm};
use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;

use super::{Port, StackPointer, TaskEntry, TaskExit, Tick};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

/// Words in the hardware-stacked exception frame.
const HW_FRAME_WORDS: usize = 8;
/// Words saved by PendSV (R4–R11).
const SW_FRAME_WORDS: usize = 8;
/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 0x0100_0000;
/// Return to Thread mode, use PSP, no FPU frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// The single-core Cortex-M4 port.
pub struct CortexM4;

impl Port for CortexM4 {
    unsafe fn initialize_stack(
        &self,
        top: *mut u8,
        entry: TaskEntry,
        arg: *mut c_void,
        exit: TaskExit,
    ) -> StackPointer {
        let top = (top as usize & !7) as *mut u32;
        unsafe {
            let hw = top.sub(HW_FRAME_WORDS);
            hw.write(arg as u32); // R0
            for i in 1..5 {
                hw.add(i).write(0); // R1-R3, R12
            }
            hw.add(5).write(exit as usize as u32); // LR
            hw.add(6).write(entry as usize as u32 & !1); // PC
            hw.add(7).write(XPSR_THUMB);

            let sw = hw.sub(SW_FRAME_WORDS);
            for i in 0..SW_FRAME_WORDS {
                sw.add(i).write(0); // R4-R11
            }
            StackPointer(sw)
        }
    }

    #[inline]
    fn request_context_switch(&self) {
        SCB::set_pendsv();
    }

    fn core_id(&self) -> usize {
        0
    }

    fn core_count(&self) -> usize {
        1
    }

    fn now(&self) -> Tick {
        TICKS.load(Ordering::Relaxed)
    }

    fn idle_wait(&self) {
        cortex_m::asm::wfi();
    }

    fn halt(&self, _reason: &str) -> ! {
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // Safety: changing the priority of the kernel's own handlers before the
    // scheduler starts cannot break a priority-based critical section.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and jump into the first task.
///
/// # Safety
/// Must only be called once, from the main thread, with a stack pointer
/// built by [`CortexM4::initialize_stack`].
pub unsafe fn start_first_task(sp: StackPointer) -> ! {
    unsafe {
        asm!(
            // Skip the software-saved R4-R11.
            "adds r0, #32",
            "msr psp, r0",
            // CONTROL.SPSEL = 1: Thread mode now uses PSP.
            "movs r0, #2",
            "msr control, r0",
            "isb",
            // Unstack the hardware frame by hand.
            "pop {{r0-r3, r12}}",
            "pop {{r4}}",       // LR: exit trampoline
            "pop {{r5}}",       // PC: task entry
            "pop {{r6}}",       // xPSR, discarded
            "mov lr, r4",
            "orr r5, r5, #1",
            "cpsie i",
            "bx r5",
            in("r0") sp.0,
            options(noreturn)
        );
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Hand the updated PSP to the scheduler
/// 3. Ask the scheduler for the next task's PSP
/// 4. Restore R4–R11 from the new stack and return to Thread mode
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {save}",
        "bl {next}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "ldr r0, ={exc_return}",
        "bx r0",
        save = sym pendsv_save,
        next = sym pendsv_next,
        exc_return = const EXC_RETURN_THREAD_PSP,
    );
}

extern "C" fn pendsv_save(psp: *mut u32) {
    crate::kernel::save_context(StackPointer(psp));
}

extern "C" fn pendsv_next() -> *mut u32 {
    crate::kernel::next_context().0
}

/// SysTick exception handler: advances the tick and runs the scheduler
/// tick, pending a switch when it asks for one.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::kernel::tick();
}
