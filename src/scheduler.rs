//! # Scheduler
//!
//! Weighted-fair preemptive scheduler for FairOS.
//!
//! ## Scheduling Algorithm
//!
//! Each core keeps a min-heap of ready tasks ordered by virtual runtime and
//! always runs the heap minimum. When a task leaves the CPU it is charged
//! `ticks_run * VRUNTIME_SCALER / weight` (at least one tick's worth), so
//! heavier tasks drift upward more slowly and get picked more often.
//!
//! At each SysTick interrupt (`scheduler_tick`):
//! 1. **Expire sleepers**: due tasks move to the ready heap, their virtual
//!    runtime lifted to the core's current minimum
//! 2. **Decrement time slice** of the running task
//! 3. **Request a reschedule** if the slice ran out, if the idle task is
//!    running while work is ready, or if a ready task now has a smaller
//!    virtual runtime than the running one
//!
//! The PendSV trap then calls `save_context` and `schedule_next_task`.
//!
//! ## Locking
//!
//! - Each core has one [`IrqLock`] over its ready heap, sleep list and
//!   current/idle slots. It also guards the scheduling fields of every task
//!   homed on that core.
//! - One global lock guards the free list, the zombie list and the id
//!   bitmap. It is only ever taken *after* a core lock, never before.
//! - A slot popped from the free list is private to the creating caller
//!   until it is published into a core's ready heap.
//! - The heap lock is never taken while a scheduler lock is held.
//!
//! ## Task Lifetime
//!
//! Deleted and exited tasks become zombies on a global list, since the
//! deleting caller may run on another core. Only the garbage collector,
//! run from the idle task, frees their stacks and returns slots to the
//! free list, and it skips a zombie that is still some core's current task.

use core::cell::UnsafeCell;
use core::ffi::c_void;

use crate::arch::{Port, StackPointer, TaskEntry, TaskExit, Tick};
use crate::config::{
    IDLE_STACK_SIZE, MAX_CORES, MAX_STACK_SIZE, MAX_TASKS, MIN_STACK_SIZE, STACK_ALIGN,
    STACK_CANARY, TIME_SLICE_TICKS, WEIGHT_IDLE,
};
use crate::error::TaskError;
use crate::heap::Heap;
use crate::ready_heap::{HeapSlots, ReadyHeap};
use crate::sleep_list::{SleepList, SleepSlots};
use crate::sync::{IrqLock, IrqLockGuard};
use crate::task::{
    vruntime_before, vruntime_max, Link, StackRegion, Task, TaskHandle, TaskId, TaskInfo,
    TaskState,
};

#[inline]
const fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

#[inline]
const fn align_down(n: usize, a: usize) -> usize {
    n & !(a - 1)
}

// ---------------------------------------------------------------------------
// Task storage
// ---------------------------------------------------------------------------

struct TaskTable([UnsafeCell<Task>; MAX_TASKS]);

// Safety: every access goes through `TaskTable::get` under the lock that
// guards the touched fields (see the module docs).
unsafe impl Sync for TaskTable {}

impl TaskTable {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const SLOT: UnsafeCell<Task> = UnsafeCell::new(Task::EMPTY);
        Self([SLOT; MAX_TASKS])
    }

    /// # Safety
    /// The caller holds the lock guarding the fields it touches and does
    /// not keep the reference across another `get` of the same slot.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self, slot: usize) -> &mut Task {
        unsafe { &mut *self.0[slot].get() }
    }
}

/// Adapter letting the ready heap and sleep list reach task fields.
struct Slots<'a>(&'a TaskTable);

impl HeapSlots for Slots<'_> {
    fn key(&self, slot: usize) -> u64 {
        unsafe { self.0.get(slot).vruntime }
    }

    fn set_index(&mut self, slot: usize, index: Option<usize>) {
        unsafe { self.0.get(slot).heap_index = index }
    }
}

impl SleepSlots for Slots<'_> {
    fn wake_at(&self, slot: usize) -> Tick {
        unsafe { self.0.get(slot).wake_at }
    }

    fn link(&self, slot: usize) -> Link {
        unsafe { self.0.get(slot).link }
    }

    fn set_link(&mut self, slot: usize, link: Link) {
        unsafe { self.0.get(slot).link = link }
    }
}

// ---------------------------------------------------------------------------
// Per-core and global state
// ---------------------------------------------------------------------------

struct CoreQueues {
    ready: ReadyHeap,
    sleepers: SleepList,
    current: Option<usize>,
    idle: Option<usize>,
    /// Largest virtual runtime ever dispatched on this core.
    min_vruntime: u64,
    switches: u64,
}

impl CoreQueues {
    const fn new() -> Self {
        Self {
            ready: ReadyHeap::new(),
            sleepers: SleepList::new(),
            current: None,
            idle: None,
            min_vruntime: 0,
            switches: 0,
        }
    }
}

struct Pool {
    free_head: Option<usize>,
    zombie_head: Option<usize>,
    id_bitmap: u32,
    next_core: usize,
}

impl Pool {
    const fn new() -> Self {
        Self {
            free_head: None,
            zombie_head: None,
            id_bitmap: 0,
            next_core: 0,
        }
    }
}

type CoreGuard<'a> = IrqLockGuard<'a, CoreQueues>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The central scheduler state: task pool, per-core queues and the heap
/// used for task stacks. Stored as a `static` in `kernel.rs`.
pub struct Scheduler<'h, P: Port> {
    heap: &'h Heap,
    port: P,
    exit_handler: TaskExit,
    tasks: TaskTable,
    pool: IrqLock<Pool>,
    cores: [IrqLock<CoreQueues>; MAX_CORES],
}

impl<'h, P: Port> Scheduler<'h, P> {
    /// Create an empty scheduler. Call [`Scheduler::init`] before use.
    pub const fn new(heap: &'h Heap, port: P, exit_handler: TaskExit) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const CORE: IrqLock<CoreQueues> = IrqLock::new(CoreQueues::new());
        Self {
            heap,
            port,
            exit_handler,
            tasks: TaskTable::new(),
            pool: IrqLock::new(Pool::new()),
            cores: [CORE; MAX_CORES],
        }
    }

    /// The platform port this scheduler drives.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The heap task stacks are allocated from.
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    #[inline]
    fn slots(&self) -> Slots<'_> {
        Slots(&self.tasks)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn task(&self, slot: usize) -> &mut Task {
        // Safety: callers follow the locking rules in the module docs.
        unsafe { self.tasks.get(slot) }
    }

    fn lock_core(&self, core: usize) -> CoreGuard<'_> {
        self.cores[core].lock()
    }

    /// Reset every slot to unused, chain them all on the free list and
    /// clear the per-core queues. No tasks exist afterwards.
    pub fn init(&self) {
        for core in &self.cores {
            *core.lock() = CoreQueues::new();
        }
        let mut pool = self.pool.lock();
        *pool = Pool::new();
        for slot in (0..MAX_TASKS).rev() {
            let t = self.task(slot);
            t.reset();
            t.link = Link::Free(pool.free_head);
            pool.free_head = Some(slot);
        }
        log::debug!("scheduler: {} slots, {} cores", MAX_TASKS, MAX_CORES);
    }

    // -- Slot management ---------------------------------------------------

    /// Pop a free slot and reserve the lowest unused id. `core` pins the
    /// task; `None` picks the next core round-robin.
    fn claim_slot(&self, core: Option<usize>) -> Result<(usize, TaskId, usize), TaskError> {
        if let Some(claimed) = self.try_claim_slot(core)? {
            return Ok(claimed);
        }
        // Emergency reclaim, then one more attempt.
        self.task_garbage_collection();
        self.try_claim_slot(core)?.ok_or_else(|| {
            log::warn!("task pool exhausted");
            TaskError::NoFreeSlot
        })
    }

    fn try_claim_slot(
        &self,
        core: Option<usize>,
    ) -> Result<Option<(usize, TaskId, usize)>, TaskError> {
        let mut pool = self.pool.lock();
        let Some(slot) = pool.free_head else {
            return Ok(None);
        };
        let bit = (!pool.id_bitmap).trailing_zeros() as usize;
        if bit >= MAX_TASKS {
            return Err(TaskError::IdsExhausted);
        }
        let t = self.task(slot);
        pool.free_head = match t.link {
            Link::Free(next) => next,
            other => {
                debug_assert!(false, "slot {} on free list with link {:?}", slot, other);
                None
            }
        };
        t.link = Link::None;
        pool.id_bitmap |= 1 << bit;
        let core = core.unwrap_or_else(|| {
            let c = pool.next_core;
            pool.next_core = (c + 1) % self.port.core_count().clamp(1, MAX_CORES);
            c
        });
        let id = TaskId::new(bit as u16 + 1).ok_or(TaskError::IdsExhausted)?;
        Ok(Some((slot, id, core)))
    }

    /// Undo `claim_slot` for a slot that was never published.
    fn release_slot(&self, slot: usize, id: TaskId) {
        let mut pool = self.pool.lock();
        pool.id_bitmap &= !(1 << (id.get() - 1));
        let t = self.task(slot);
        t.reset();
        t.link = Link::Free(pool.free_head);
        pool.free_head = Some(slot);
    }

    /// Fill in a claimed slot and make it runnable on its core.
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        slot: usize,
        id: TaskId,
        core: usize,
        stack: StackRegion,
        entry: TaskEntry,
        arg: *mut c_void,
        weight: u32,
        is_idle: bool,
    ) -> TaskHandle {
        let t = self.task(slot);
        t.init(id, stack, weight, core);
        t.is_idle = is_idle;
        let top = align_down(stack.top() as usize, STACK_ALIGN) as *mut u8;
        // Safety: the region was validated by the caller and is owned by
        // this slot from here on.
        unsafe {
            t.arm_canary(STACK_CANARY);
            t.sp = self.port.initialize_stack(top, entry, arg, self.exit_handler);
        }
        let handle = TaskHandle {
            slot,
            generation: t.generation,
            id,
        };

        let mut q = self.lock_core(core);
        let t = self.task(slot);
        t.state = TaskState::Ready;
        if is_idle {
            q.idle = Some(slot);
        } else {
            t.vruntime = self.floor(&q);
            q.ready.push(slot, &mut self.slots());
        }
        drop(q);

        log::debug!("task {} created on core {} (weight {})", id, core, weight);
        handle
    }

    fn validate_stack_size(bytes: usize) -> Result<usize, TaskError> {
        if !(MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&bytes) {
            return Err(TaskError::InvalidStackSize(bytes));
        }
        Ok(align_up(bytes, STACK_ALIGN))
    }

    fn alloc_stack(&self, size: usize) -> Option<StackRegion> {
        let base = self.heap.malloc(size).or_else(|| {
            self.task_garbage_collection();
            self.heap.malloc(size)
        })?;
        Some(StackRegion {
            base: base.as_ptr(),
            len: size,
            owned: true,
        })
    }

    // -- Creation ----------------------------------------------------------

    /// Create a task with a heap-allocated stack of `stack_bytes` and make
    /// it ready on the next core in round-robin order.
    pub fn task_create(
        &self,
        entry: TaskEntry,
        arg: *mut c_void,
        stack_bytes: usize,
        weight: u32,
    ) -> Result<TaskHandle, TaskError> {
        if weight == 0 {
            return Err(TaskError::InvalidWeight);
        }
        let size = Self::validate_stack_size(stack_bytes)?;
        let (slot, id, core) = self.claim_slot(None)?;
        let Some(stack) = self.alloc_stack(size) else {
            self.release_slot(slot, id);
            log::warn!("stack allocation of {} bytes failed", size);
            return Err(TaskError::OutOfMemory(size));
        };
        Ok(self.spawn(slot, id, core, stack, entry, arg, weight, false))
    }

    /// Create a task on a caller-supplied stack. The buffer must not belong
    /// to the managed heap, so the garbage collector can never free it.
    pub fn task_create_static(
        &self,
        entry: TaskEntry,
        arg: *mut c_void,
        stack: &'static mut [u8],
        weight: u32,
    ) -> Result<TaskHandle, TaskError> {
        if weight == 0 {
            return Err(TaskError::InvalidWeight);
        }
        if stack.is_empty() {
            return Err(TaskError::InvalidStackSize(0));
        }
        let start = stack.as_mut_ptr() as usize;
        let end = start + stack.len();
        if self.heap.contains(start as *const u8) || self.heap.contains((end - 1) as *const u8) {
            return Err(TaskError::StackInHeap);
        }
        let base = align_up(start, STACK_ALIGN);
        let len = align_down(end.saturating_sub(base), STACK_ALIGN);
        if !(MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&len) {
            return Err(TaskError::InvalidStackSize(len));
        }
        let (slot, id, core) = self.claim_slot(None)?;
        let region = StackRegion {
            base: base as *mut u8,
            len,
            owned: false,
        };
        Ok(self.spawn(slot, id, core, region, entry, arg, weight, false))
    }

    /// Create the idle task for `core`. The idle task never enters the
    /// ready heap; it runs whenever nothing else is ready.
    pub fn start_core(&'static self, core: usize) -> Result<TaskHandle, TaskError> {
        if core >= MAX_CORES {
            return Err(TaskError::NotFound);
        }
        if self.lock_core(core).idle.is_some() {
            return Err(TaskError::InvalidState);
        }
        let (slot, id, core) = self.claim_slot(Some(core))?;
        let Some(stack) = self.alloc_stack(IDLE_STACK_SIZE) else {
            self.release_slot(slot, id);
            return Err(TaskError::OutOfMemory(IDLE_STACK_SIZE));
        };
        let arg = self as *const Self as *mut c_void;
        Ok(self.spawn(slot, id, core, stack, idle_entry::<P>, arg, WEIGHT_IDLE, true))
    }

    /// One pass of the idle loop: reclaim zombies, scan for stack
    /// overflow, then wait for the next interrupt.
    pub fn idle_pass(&self) {
        self.task_garbage_collection();
        self.task_check_stack_overflow();
        self.port.idle_wait();
    }

    // -- Context switching -------------------------------------------------

    /// Store the stack pointer of the task being switched out on the
    /// calling core.
    pub fn save_context(&self, sp: StackPointer) {
        let q = self.lock_core(self.port.core_id());
        if let Some(cur) = q.current {
            self.task(cur).sp = sp;
        }
    }

    /// Pick the next task for the calling core and return its saved stack
    /// pointer. Charges the outgoing task and puts it back in the ready
    /// heap if it is still runnable.
    pub fn schedule_next_task(&self) -> StackPointer {
        let core = self.port.core_id();
        let now = self.port.now();
        let mut q = self.lock_core(core);

        let prev = q.current.take();
        if let Some(cur) = prev {
            let t = self.task(cur);
            if t.is_idle {
                if t.state == TaskState::Running {
                    t.state = TaskState::Ready;
                }
            } else {
                t.charge(now.wrapping_sub(t.run_start));
                match (t.state, t.heap_index) {
                    (TaskState::Running, _) => {
                        t.state = TaskState::Ready;
                        q.ready.push(cur, &mut self.slots());
                    }
                    // Woken before it got switched out: already queued.
                    (TaskState::Ready, Some(index)) => q.ready.update(index, &mut self.slots()),
                    _ => {}
                }
            }
        }

        let next = match q.ready.pop(&mut self.slots()) {
            Some(slot) => Some(slot),
            None => q.idle,
        };
        let Some(next) = next else {
            drop(q);
            log::error!("core {}: no runnable task and no idle task", core);
            self.port.halt("no runnable task");
        };

        let t = self.task(next);
        t.state = TaskState::Running;
        t.run_start = now;
        t.slice_left = TIME_SLICE_TICKS;
        if !t.is_idle {
            q.min_vruntime = vruntime_max(q.min_vruntime, t.vruntime);
        }
        if prev != Some(next) {
            q.switches += 1;
        }
        q.current = Some(next);
        t.sp
    }

    /// Timer interrupt hook for the calling core. Returns whether a
    /// context switch should be requested.
    pub fn scheduler_tick(&self) -> bool {
        let core = self.port.core_id();
        let now = self.port.now();
        let mut q = self.lock_core(core);

        let floor = self.floor(&q);
        while let Some(slot) = q.sleepers.pop_expired(now, &mut self.slots()) {
            let t = self.task(slot);
            t.state = TaskState::Ready;
            t.vruntime = vruntime_max(t.vruntime, floor);
            q.ready.push(slot, &mut self.slots());
        }

        let Some(cur) = q.current else {
            return !q.ready.is_empty();
        };
        let top = q.ready.peek().map(|s| self.task(s).vruntime);
        let t = self.task(cur);
        if t.is_idle {
            return top.is_some();
        }
        if t.state != TaskState::Running {
            // Blocked or deleted but not yet switched out.
            return true;
        }
        t.slice_left = t.slice_left.saturating_sub(1);
        let mut resched = t.slice_left == 0;
        if let Some(top) = top {
            resched |= vruntime_before(top, t.vruntime);
        }
        resched
    }

    /// Voluntarily give up the CPU. The task is charged at least one tick.
    pub fn task_yield(&self) {
        self.port.request_context_switch();
    }

    /// Smallest virtual runtime a task entering this core's heap may have.
    fn floor(&self, q: &CoreQueues) -> u64 {
        match q.ready.peek() {
            Some(slot) => self.task(slot).vruntime,
            None => q.min_vruntime,
        }
    }

    // -- Handles -----------------------------------------------------------

    /// Lock the home core of `handle` and check the handle is current.
    fn lock_live(&self, handle: &TaskHandle) -> Result<CoreGuard<'_>, TaskError> {
        if handle.slot >= MAX_TASKS {
            return Err(TaskError::StaleHandle);
        }
        let core = self.task(handle.slot).core;
        let q = self.lock_core(core.min(MAX_CORES - 1));
        let t = self.task(handle.slot);
        if !t.matches(handle) || !t.state.is_live() || t.core != core {
            return Err(TaskError::StaleHandle);
        }
        Ok(q)
    }

    fn handle_of(&self, slot: usize) -> Option<TaskHandle> {
        let t = self.task(slot);
        Some(TaskHandle {
            slot,
            generation: t.generation,
            id: t.id?,
        })
    }

    /// Task running on the calling core.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.current_task_on(self.port.core_id())
    }

    /// Task running on `core`.
    pub fn current_task_on(&self, core: usize) -> Option<TaskHandle> {
        let q = self.lock_core(core);
        q.current.and_then(|slot| self.handle_of(slot))
    }

    /// Find a live task by id.
    pub fn find_task(&self, id: TaskId) -> Option<TaskHandle> {
        for core in 0..MAX_CORES {
            let _q = self.lock_core(core);
            for slot in 0..MAX_TASKS {
                let t = self.task(slot);
                if t.core == core && t.state.is_live() && t.id == Some(id) {
                    return self.handle_of(slot);
                }
            }
        }
        None
    }

    // -- State transitions -------------------------------------------------

    /// Take `slot` out of whatever its state says it is queued on.
    fn detach(&self, q: &mut CoreQueues, slot: usize) {
        let t = self.task(slot);
        match t.state {
            TaskState::Ready => {
                if let Some(index) = t.heap_index {
                    q.ready.remove(index, &mut self.slots());
                }
            }
            TaskState::Sleeping => {
                q.sleepers.remove(slot, &mut self.slots());
            }
            _ => {}
        }
    }

    /// Queue `slot` as ready, lifting its virtual runtime to the floor.
    /// Returns whether it should preempt the core's current task.
    fn make_ready(&self, q: &mut CoreQueues, slot: usize) -> bool {
        let floor = self.floor(q);
        let t = self.task(slot);
        t.state = TaskState::Ready;
        t.vruntime = vruntime_max(t.vruntime, floor);
        let vr = t.vruntime;
        if q.current == Some(slot) {
            // Still on the CPU: it only has to stay there.
            t.state = TaskState::Running;
            return false;
        }
        q.ready.push(slot, &mut self.slots());
        match q.current {
            None => true,
            Some(cur) => {
                let c = self.task(cur);
                c.is_idle || vruntime_before(vr, c.vruntime)
            }
        }
    }

    /// Park `slot` as blocked, optionally until `wake_at`.
    fn park(&self, q: &mut CoreQueues, slot: usize, wake_at: Option<Tick>) {
        self.detach(q, slot);
        let t = self.task(slot);
        match wake_at {
            Some(at) => {
                t.state = TaskState::Sleeping;
                t.wake_at = at;
                t.link = Link::None;
                q.sleepers.insert(slot, &mut self.slots());
            }
            None => t.state = TaskState::Blocked,
        }
    }

    /// Turn `slot` into a zombie and hand it to the global zombie list.
    fn retire(&self, q: &mut CoreQueues, slot: usize) {
        self.detach(q, slot);
        let t = self.task(slot);
        t.state = TaskState::Zombie;
        t.notify_waiting = false;
        t.event_mask = 0;
        let id = t.id.take();
        let mut pool = self.pool.lock();
        debug_assert_eq!(t.link, Link::None, "zombie still linked");
        t.link = Link::Zombie(pool.zombie_head);
        t.retired_id = id;
        pool.zombie_head = Some(slot);
        drop(pool);
        if let Some(id) = id {
            log::debug!("task {} retired", id);
        }
    }

    /// The calling core's current task is `slot` and just came back from a
    /// wait: make sure it is on no queue and marked running.
    fn resume(&self, q: &mut CoreQueues, slot: usize) {
        if q.current != Some(slot) {
            return;
        }
        let t = self.task(slot);
        if t.state == TaskState::Zombie {
            return;
        }
        self.detach(q, slot);
        self.task(slot).state = TaskState::Running;
    }

    fn request_switch_if_local(&self, core: usize, needed: bool) {
        if needed && core == self.port.core_id() {
            self.port.request_context_switch();
        }
    }

    /// Block `handle`. With `wake_at` the task sleeps until that tick,
    /// otherwise until `task_unblock`.
    pub fn task_block(&self, handle: TaskHandle, wake_at: Option<Tick>) -> Result<(), TaskError> {
        let mut q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        if t.is_idle {
            return Err(TaskError::IdleTask);
        }
        let core = t.core;
        self.park(&mut q, handle.slot, wake_at);
        let running = q.current == Some(handle.slot);
        drop(q);
        self.request_switch_if_local(core, running);
        Ok(())
    }

    /// Make a blocked or sleeping task ready. Returns `false` if it was not
    /// waiting.
    pub fn task_unblock(&self, handle: TaskHandle) -> Result<bool, TaskError> {
        let mut q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        if !t.state.is_waiting() {
            return Ok(false);
        }
        let core = t.core;
        self.detach(&mut q, handle.slot);
        let preempt = self.make_ready(&mut q, handle.slot);
        drop(q);
        self.request_switch_if_local(core, preempt);
        Ok(true)
    }

    /// Block the task running on the calling core and request a switch.
    pub fn task_block_current(&self, wake_at: Option<Tick>) -> Result<TaskHandle, TaskError> {
        let mut q = self.lock_core(self.port.core_id());
        let slot = q.current.ok_or(TaskError::NotFound)?;
        if self.task(slot).is_idle {
            return Err(TaskError::IdleTask);
        }
        let handle = self.handle_of(slot).ok_or(TaskError::StaleHandle)?;
        self.park(&mut q, slot, wake_at);
        drop(q);
        self.port.request_context_switch();
        Ok(handle)
    }

    /// Finish a wait started with [`Scheduler::task_block_current`] once
    /// control is back: whatever woke the task (or did not), it leaves no
    /// queue entry behind.
    pub fn task_resume_current(&self, handle: TaskHandle) {
        let core = self.port.core_id();
        let mut q = self.lock_core(core);
        self.resume(&mut q, handle.slot);
    }

    /// Move `handle` to `state`. `Ready`, `Blocked` and `Zombie` are
    /// accepted; sleeping needs a deadline and goes through `task_block`.
    pub fn task_set_state(&self, handle: TaskHandle, state: TaskState) -> Result<(), TaskError> {
        let mut q = self.lock_live(&handle)?;
        let slot = handle.slot;
        let t = self.task(slot);
        if t.is_idle && state != TaskState::Ready {
            return Err(TaskError::IdleTask);
        }
        let core = t.core;
        let running = q.current == Some(slot);
        let switch = match state {
            TaskState::Ready => {
                if t.state == TaskState::Ready || t.state == TaskState::Running {
                    false
                } else {
                    self.detach(&mut q, slot);
                    self.make_ready(&mut q, slot)
                }
            }
            TaskState::Blocked => {
                self.park(&mut q, slot, None);
                running
            }
            TaskState::Zombie => {
                self.retire(&mut q, slot);
                running
            }
            TaskState::Running | TaskState::Sleeping | TaskState::Unused => {
                return Err(TaskError::InvalidState)
            }
        };
        drop(q);
        self.request_switch_if_local(core, switch);
        Ok(())
    }

    /// Sleep the calling task for `ticks`. Zero ticks is a plain yield.
    pub fn task_sleep_ticks(&self, ticks: Tick) -> Result<(), TaskError> {
        if ticks == 0 {
            if self.current_is_idle()? {
                return Err(TaskError::IdleTask);
            }
            self.task_yield();
            return Ok(());
        }
        let wake = self.port.now().wrapping_add(ticks);
        let handle = self.task_block_current(Some(wake))?;
        self.task_resume_current(handle);
        Ok(())
    }

    fn current_is_idle(&self) -> Result<bool, TaskError> {
        let q = self.lock_core(self.port.core_id());
        let slot = q.current.ok_or(TaskError::NotFound)?;
        Ok(self.task(slot).is_idle)
    }

    // -- Deletion ----------------------------------------------------------

    /// Retire the calling core's current task without switching away.
    /// [`Scheduler::task_exit`] is this plus the final yield loop.
    pub fn task_exit_current(&self) -> Result<(), TaskError> {
        let mut q = self.lock_core(self.port.core_id());
        let slot = q.current.ok_or(TaskError::NotFound)?;
        if self.task(slot).is_idle {
            return Err(TaskError::IdleTask);
        }
        self.retire(&mut q, slot);
        Ok(())
    }

    /// Terminate the calling task. Never returns.
    pub fn task_exit(&self) -> ! {
        if let Err(e) = self.task_exit_current() {
            log::error!("task_exit outside a task: {}", e);
            self.port.halt("task_exit outside a task");
        }
        loop {
            self.port.request_context_switch();
            self.port.idle_wait();
        }
    }

    /// Delete the task with `id`. Deleting the caller is `task_exit`.
    pub fn task_delete(&self, id: TaskId) -> Result<(), TaskError> {
        let handle = self.find_task(id).ok_or(TaskError::NotFound)?;
        let mut q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        if t.is_idle {
            return Err(TaskError::IdleTask);
        }
        let core = t.core;
        if core == self.port.core_id() && q.current == Some(handle.slot) {
            drop(q);
            self.task_exit();
        }
        self.retire(&mut q, handle.slot);
        Ok(())
    }

    /// Reclaim every zombie: free heap-owned stacks and return the slots to
    /// the free list. Returns the number of slots reclaimed.
    pub fn task_garbage_collection(&self) -> usize {
        let mut reclaimed = 0;
        let mut busy = [0usize; MAX_TASKS];
        let mut busy_len = 0;

        loop {
            let slot = {
                let mut pool = self.pool.lock();
                let Some(slot) = pool.zombie_head else {
                    break;
                };
                let t = self.task(slot);
                pool.zombie_head = match t.link {
                    Link::Zombie(next) => next,
                    other => {
                        debug_assert!(false, "slot {} on zombie list with link {:?}", slot, other);
                        None
                    }
                };
                t.link = Link::None;
                slot
            };

            let core = self.task(slot).core;
            if self.lock_core(core).current == Some(slot) {
                // Still executing its last instructions; next pass.
                busy[busy_len] = slot;
                busy_len += 1;
                continue;
            }

            let stack = self.task(slot).stack;
            if stack.owned && self.heap.contains(stack.base) {
                // Safety: the stack came from this heap in `task_create`
                // and the zombie will never run again.
                if let Err(e) = unsafe { self.heap.free(stack.base) } {
                    log::warn!("gc: stack at {:p} not freed: {}", stack.base, e);
                }
            }

            let q = self.lock_core(core);
            let mut pool = self.pool.lock();
            let t = self.task(slot);
            if let Some(id) = t.retired_id {
                pool.id_bitmap &= !(1 << (id.get() - 1));
            }
            t.reset();
            t.link = Link::Free(pool.free_head);
            pool.free_head = Some(slot);
            drop(pool);
            drop(q);
            reclaimed += 1;
        }

        if busy_len > 0 {
            let mut pool = self.pool.lock();
            for &slot in &busy[..busy_len] {
                self.task(slot).link = Link::Zombie(pool.zombie_head);
                pool.zombie_head = Some(slot);
            }
        }
        if reclaimed > 0 {
            log::debug!("gc: reclaimed {} slots", reclaimed);
        }
        reclaimed
    }

    /// Check every live task's stack canary. A smashed canary deletes the
    /// task, unless it is running on some core, in which case the system
    /// halts. Returns the number of tasks deleted.
    pub fn task_check_stack_overflow(&self) -> usize {
        let mut killed = 0;
        for core in 0..MAX_CORES {
            let mut q = self.lock_core(core);
            for slot in 0..MAX_TASKS {
                let t = self.task(slot);
                if t.core != core || !t.state.is_live() || t.stack.len == 0 {
                    continue;
                }
                // Safety: live tasks own a valid stack region.
                if unsafe { t.canary_intact(STACK_CANARY) } {
                    continue;
                }
                if q.current == Some(slot) {
                    let id = t.id;
                    drop(q);
                    log::error!("stack overflow in running task {:?}", id);
                    self.port.halt("stack overflow in running task");
                }
                log::warn!("stack overflow in task {:?}, deleting", t.id);
                self.retire(&mut q, slot);
                killed += 1;
            }
        }
        killed
    }

    // -- Notifications -----------------------------------------------------

    /// OR `value` into the task's pending notification and wake it if it is
    /// waiting for one.
    pub fn task_notify(&self, handle: TaskHandle, value: u32) -> Result<(), TaskError> {
        let mut q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        t.notify_value |= value;
        t.notify_pending = true;
        let core = t.core;
        let mut preempt = false;
        if t.notify_waiting && t.state.is_waiting() {
            t.notify_waiting = false;
            self.detach(&mut q, handle.slot);
            preempt = self.make_ready(&mut q, handle.slot);
        }
        drop(q);
        self.request_switch_if_local(core, preempt);
        Ok(())
    }

    /// Wait for a notification. `timeout = None` waits forever,
    /// `Some(0)` only polls. Returns `Ok(None)` on timeout.
    pub fn task_notify_wait(&self, timeout: Option<Tick>) -> Result<Option<u32>, TaskError> {
        let core = self.port.core_id();
        let slot = {
            let mut q = self.lock_core(core);
            let slot = q.current.ok_or(TaskError::NotFound)?;
            let t = self.task(slot);
            if t.is_idle {
                return Err(TaskError::IdleTask);
            }
            if let Some(v) = t.take_notification() {
                return Ok(Some(v));
            }
            if timeout == Some(0) {
                return Ok(None);
            }
            t.notify_waiting = true;
            let wake = timeout.map(|ticks| self.port.now().wrapping_add(ticks));
            self.park(&mut q, slot, wake);
            slot
        };
        self.port.request_context_switch();

        let mut q = self.lock_core(core);
        self.resume(&mut q, slot);
        let t = self.task(slot);
        t.notify_waiting = false;
        Ok(t.take_notification())
    }

    // -- Accessors for synchronization primitives --------------------------

    /// Current state of a live task.
    pub fn task_state(&self, handle: TaskHandle) -> Result<TaskState, TaskError> {
        let _q = self.lock_live(&handle)?;
        Ok(self.task(handle.slot).state)
    }

    /// Id of a live task.
    pub fn task_id(&self, handle: TaskHandle) -> Result<TaskId, TaskError> {
        let _q = self.lock_live(&handle)?;
        Ok(handle.id)
    }

    /// Effective weight, including any inheritance boost.
    pub fn task_weight(&self, handle: TaskHandle) -> Result<u32, TaskError> {
        let _q = self.lock_live(&handle)?;
        Ok(self.task(handle.slot).weight)
    }

    /// Weight the task was created with.
    pub fn task_base_weight(&self, handle: TaskHandle) -> Result<u32, TaskError> {
        let _q = self.lock_live(&handle)?;
        Ok(self.task(handle.slot).base_weight)
    }

    /// Set the effective weight (priority inheritance boost or restore).
    /// The base weight is untouched.
    pub fn task_set_weight(&self, handle: TaskHandle, weight: u32) -> Result<(), TaskError> {
        if weight == 0 {
            return Err(TaskError::InvalidWeight);
        }
        let _q = self.lock_live(&handle)?;
        self.task(handle.slot).weight = weight;
        Ok(())
    }

    /// Record what an event-group wait by `handle` is looking for.
    pub fn task_set_event_wait(
        &self,
        handle: TaskHandle,
        mask: u32,
        wait_all: bool,
    ) -> Result<(), TaskError> {
        let _q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        t.event_mask = mask;
        t.event_wait_all = wait_all;
        Ok(())
    }

    /// The `(mask, wait_all)` pair of a pending event-group wait.
    pub fn task_event_wait_mask(&self, handle: TaskHandle) -> Result<(u32, bool), TaskError> {
        let _q = self.lock_live(&handle)?;
        let t = self.task(handle.slot);
        Ok((t.event_mask, t.event_wait_all))
    }

    // -- Diagnostics -------------------------------------------------------

    /// Diagnostic snapshot of a live task.
    pub fn task_info(&self, handle: TaskHandle) -> Result<TaskInfo, TaskError> {
        let _q = self.lock_live(&handle)?;
        Ok(self.info_of(handle))
    }

    fn info_of(&self, handle: TaskHandle) -> TaskInfo {
        let t = self.task(handle.slot);
        TaskInfo {
            handle,
            state: t.state,
            weight: t.weight,
            base_weight: t.base_weight,
            vruntime: t.vruntime,
            core: t.core,
            stack_size: t.stack.len,
            static_stack: !t.stack.owned,
            is_idle: t.is_idle,
        }
    }

    /// Snapshot of pool slot `index` if it holds a live task.
    pub fn scheduler_get_task_by_index(&self, index: usize) -> Option<TaskInfo> {
        if index >= MAX_TASKS {
            return None;
        }
        let core = self.task(index).core.min(MAX_CORES - 1);
        let _q = self.lock_core(core);
        let t = self.task(index);
        if !t.state.is_live() || t.core != core {
            return None;
        }
        let handle = self.handle_of(index)?;
        Some(self.info_of(handle))
    }

    /// Number of live tasks, idle tasks included.
    pub fn task_count(&self) -> usize {
        (0..MAX_TASKS)
            .filter(|&i| self.scheduler_get_task_by_index(i).is_some())
            .count()
    }

    /// Number of times `core` switched to a different task.
    pub fn context_switches(&self, core: usize) -> u64 {
        self.lock_core(core).switches
    }

    /// Tasks waiting in the ready heap of `core`.
    pub fn ready_count(&self, core: usize) -> usize {
        self.lock_core(core).ready.len()
    }
}

/// Entry point of every idle task; `arg` is the owning scheduler.
extern "C" fn idle_entry<P: Port>(arg: *mut c_void) {
    // Safety: `start_core` passes a `&'static Scheduler<P>`.
    let sched = unsafe { &*(arg as *const Scheduler<'static, P>) };
    loop {
        sched.idle_pass();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
