//! # Heap
//!
//! General-purpose allocator over one contiguous memory region, used for
//! task stacks, kernel objects and application buffers.
//!
//! ## Layout
//!
//! The pool is an implicit list of blocks in address order. Every block
//! starts with a header:
//!
//! ```text
//!   ┌──────────────┬──────────────┬──────────────┬──────────────┐
//!   │  prev_phys   │ size | FREE  │  next_free   │  prev_free   │ ...
//!   └──────────────┴──────────────┴──────────────┴──────────────┘
//!   │◄──────── OVERHEAD ─────────►│◄── payload (only links while free)
//! ```
//!
//! `size` is the whole block including the header. `prev_phys` points at the
//! physically preceding block so both neighbours are reachable in O(1) when a
//! block is freed. The free-list links overlay the payload and are only
//! meaningful while the block is free. No two physically adjacent blocks are
//! ever free at the same time.
//!
//! ## Bucket search
//!
//! Free blocks are filed in a two-level table. The first level is the index
//! of the most significant bit of the size; the second level splits each
//! power-of-two range into `SL_COUNT` linear buckets. Sizes below
//! `SMALL_BLOCK` share first level 0 with `ALIGN`-wide buckets. One bitmap
//! per level makes "smallest non-empty bucket at or above" a pair of
//! trailing-zero counts.
//!
//! A request is rounded up to the next bucket boundary before the search, so
//! any block found in the chosen bucket is large enough.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::error::{HeapError, IntegrityError};
use crate::sync::IrqLock;

/// Alignment of every payload and every block size.
pub const ALIGN: usize = 8;
const ALIGN_LOG2: u32 = ALIGN.trailing_zeros();

const SL_LOG2: u32 = 4;
const SL_COUNT: usize = 1 << SL_LOG2;

const FL_SHIFT: u32 = SL_LOG2 + ALIGN_LOG2;
const SMALL_BLOCK: usize = 1 << FL_SHIFT;

/// Most significant bit of the largest block the table can file.
const FL_MAX: u32 = 28;
const FL_COUNT: usize = (FL_MAX - FL_SHIFT + 2) as usize;

/// Largest block (and therefore pool) the allocator manages.
pub const MAX_BLOCK: usize = (1 << (FL_MAX + 1)) - ALIGN;

const FREE_BIT: usize = 0b1;

#[repr(C)]
struct BlockHeader {
    prev_phys: *mut BlockHeader,
    size: usize,
    next_free: *mut BlockHeader,
    prev_free: *mut BlockHeader,
}

/// Bytes of header in front of every payload.
pub const OVERHEAD: usize = 2 * size_of::<usize>();

/// Smallest block worth splitting off: room for the header with links.
pub const MIN_BLOCK: usize = size_of::<BlockHeader>();

static_assertions::const_assert!(ALIGN.is_power_of_two());
static_assertions::const_assert!(OVERHEAD % ALIGN == 0);
static_assertions::const_assert!(MIN_BLOCK % ALIGN == 0);
static_assertions::const_assert!(SMALL_BLOCK / SL_COUNT == ALIGN);
static_assertions::const_assert!(FL_COUNT <= 32);

#[inline]
const fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

#[inline]
const fn align_down(n: usize, a: usize) -> usize {
    n & !(a - 1)
}

#[inline]
fn msb(n: usize) -> u32 {
    usize::BITS - 1 - n.leading_zeros()
}

/// Bucket holding blocks of exactly `size` bytes.
#[inline]
fn mapping(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK {
        (0, size / ALIGN)
    } else {
        let f = msb(size);
        let sl = (size >> (f - SL_LOG2)) ^ SL_COUNT;
        ((f - FL_SHIFT + 1) as usize, sl)
    }
}

/// First bucket whose every block is at least `size` bytes.
#[inline]
fn mapping_search(size: usize) -> (usize, usize) {
    let size = if size >= SMALL_BLOCK {
        size + (1 << (msb(size) - SL_LOG2)) - 1
    } else {
        size
    };
    mapping(size)
}

/// Total block size needed to serve a `size`-byte request.
#[inline]
fn adjust_request(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_BLOCK - OVERHEAD {
        return None;
    }
    Some(align_up(size + OVERHEAD, ALIGN).max(MIN_BLOCK))
}

/// Snapshot of allocator occupancy, as reported by the `heap` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Bytes under management, headers included.
    pub total: usize,
    /// Bytes in allocated blocks, headers included.
    pub used: usize,
    /// Bytes in free blocks, headers included.
    pub free: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
    /// Number of free blocks.
    pub fragments: usize,
    /// Number of allocated blocks.
    pub used_blocks: usize,
}

/// Allocator control block.
struct Tlsf {
    start: usize,
    end: usize,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_COUNT],
    heads: [[*mut BlockHeader; SL_COUNT]; FL_COUNT],
    free_bytes: usize,
    free_blocks: usize,
    used_bytes: usize,
    used_blocks: usize,
}

// Safety: the raw pointers all point into the pool owned by this control
// block, and the control block is only reached through its `IrqLock`.
unsafe impl Send for Tlsf {}

impl Tlsf {
    const fn new() -> Self {
        Self {
            start: 0,
            end: 0,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            heads: [[ptr::null_mut(); SL_COUNT]; FL_COUNT],
            free_bytes: 0,
            free_blocks: 0,
            used_bytes: 0,
            used_blocks: 0,
        }
    }

    #[inline]
    fn initialized(&self) -> bool {
        self.end > self.start
    }

    unsafe fn init(&mut self, start: usize, size: usize) -> Result<(), HeapError> {
        *self = Self::new();
        let begin = align_up(start, ALIGN);
        let end = align_down(start.saturating_add(size), ALIGN);
        if end <= begin || end - begin < MIN_BLOCK {
            return Err(HeapError::OutOfRange);
        }
        let len = (end - begin).min(MAX_BLOCK);
        self.start = begin;
        self.end = begin + len;

        let block = begin as *mut BlockHeader;
        unsafe {
            (*block).prev_phys = ptr::null_mut();
            (*block).size = len;
            self.insert_free(block);
        }
        Ok(())
    }

    // -- Block helpers -----------------------------------------------------

    #[inline]
    unsafe fn block_size(b: *mut BlockHeader) -> usize {
        unsafe { (*b).size & !FREE_BIT }
    }

    #[inline]
    unsafe fn is_free(b: *mut BlockHeader) -> bool {
        unsafe { (*b).size & FREE_BIT != 0 }
    }

    #[inline]
    unsafe fn set_size(b: *mut BlockHeader, size: usize) {
        unsafe { (*b).size = size | ((*b).size & FREE_BIT) }
    }

    #[inline]
    unsafe fn next_phys(&self, b: *mut BlockHeader) -> Option<*mut BlockHeader> {
        let next = b as usize + unsafe { Self::block_size(b) };
        (next < self.end).then_some(next as *mut BlockHeader)
    }

    #[inline]
    fn payload(b: *mut BlockHeader) -> NonNull<u8> {
        // Safety: block headers are never null.
        unsafe { NonNull::new_unchecked((b as *mut u8).add(OVERHEAD)) }
    }

    /// Recover and sanity-check the header of an allocated payload.
    unsafe fn block_of(&self, ptr: *mut u8) -> Result<*mut BlockHeader, HeapError> {
        if !self.initialized() {
            return Err(HeapError::Uninitialized);
        }
        if ptr.is_null() {
            return Err(HeapError::NullPointer);
        }
        let addr = ptr as usize;
        if addr < self.start + OVERHEAD || addr >= self.end {
            return Err(HeapError::OutOfRange);
        }
        if addr % ALIGN != 0 {
            return Err(HeapError::NotAllocated);
        }
        let b = (addr - OVERHEAD) as *mut BlockHeader;
        unsafe {
            if Self::is_free(b) {
                return Err(HeapError::NotAllocated);
            }
            // The header must be where its predecessor says it is.
            let prev = (*b).prev_phys;
            let linked = if prev.is_null() {
                b as usize == self.start
            } else {
                (prev as usize) % ALIGN == 0
                    && (prev as usize) >= self.start
                    && (prev as usize) < b as usize
                    && self.next_phys(prev) == Some(b)
            };
            if !linked {
                return Err(HeapError::NotAllocated);
            }
        }
        Ok(b)
    }

    // -- Free lists --------------------------------------------------------

    unsafe fn insert_free(&mut self, b: *mut BlockHeader) {
        unsafe {
            let size = Self::block_size(b);
            let (fl, sl) = mapping(size);
            let head = self.heads[fl][sl];
            (*b).size = size | FREE_BIT;
            (*b).next_free = head;
            (*b).prev_free = ptr::null_mut();
            if !head.is_null() {
                (*head).prev_free = b;
            }
            self.heads[fl][sl] = b;
            self.sl_bitmap[fl] |= 1 << sl;
            self.fl_bitmap |= 1 << fl;
            self.free_bytes += size;
            self.free_blocks += 1;
        }
    }

    unsafe fn remove_free(&mut self, b: *mut BlockHeader) {
        unsafe {
            let size = Self::block_size(b);
            let (fl, sl) = mapping(size);
            let next = (*b).next_free;
            let prev = (*b).prev_free;
            if !next.is_null() {
                (*next).prev_free = prev;
            }
            if !prev.is_null() {
                (*prev).next_free = next;
            }
            if self.heads[fl][sl] == b {
                self.heads[fl][sl] = next;
                if next.is_null() {
                    self.sl_bitmap[fl] &= !(1 << sl);
                    if self.sl_bitmap[fl] == 0 {
                        self.fl_bitmap &= !(1 << fl);
                    }
                }
            }
            (*b).size = size;
            (*b).next_free = ptr::null_mut();
            (*b).prev_free = ptr::null_mut();
            self.free_bytes -= size;
            self.free_blocks -= 1;
        }
    }

    fn find_suitable(&self, fl: usize, sl: usize) -> Option<*mut BlockHeader> {
        if fl >= FL_COUNT {
            return None;
        }
        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        if sl_map == 0 {
            let fl_map = self.fl_bitmap & (!0u32).checked_shl(fl as u32 + 1).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }
            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
        }
        let sl = sl_map.trailing_zeros() as usize;
        let head = self.heads[fl][sl];
        (!head.is_null()).then_some(head)
    }

    /// Cut `b` down to `size` bytes if the tail can stand as its own block,
    /// merging the tail with a free successor. `b` must not be on a free
    /// list. Returns the bytes given up.
    unsafe fn trim(&mut self, b: *mut BlockHeader, size: usize) -> usize {
        unsafe {
            let cur = Self::block_size(b);
            if cur < size + MIN_BLOCK {
                return 0;
            }
            let rest = (b as usize + size) as *mut BlockHeader;
            (*rest).prev_phys = b;
            (*rest).size = cur - size;
            Self::set_size(b, size);

            if let Some(next) = self.next_phys(rest) {
                if Self::is_free(next) {
                    self.remove_free(next);
                    (*rest).size += Self::block_size(next);
                }
            }
            if let Some(next) = self.next_phys(rest) {
                (*next).prev_phys = rest;
            }
            self.insert_free(rest);
            cur - size
        }
    }

    // -- Operations --------------------------------------------------------

    unsafe fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.initialized() {
            return None;
        }
        let need = adjust_request(size)?;
        let (fl, sl) = mapping_search(need);
        let b = self.find_suitable(fl, sl)?;
        unsafe {
            self.remove_free(b);
            self.trim(b, need);
            self.used_bytes += Self::block_size(b);
        }
        self.used_blocks += 1;
        Some(Self::payload(b))
    }

    unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let mut b = unsafe { self.block_of(ptr)? };
        unsafe {
            self.used_bytes -= Self::block_size(b);
            self.used_blocks -= 1;

            let prev = (*b).prev_phys;
            if !prev.is_null() && Self::is_free(prev) {
                self.remove_free(prev);
                Self::set_size(prev, Self::block_size(prev) + Self::block_size(b));
                b = prev;
            }
            if let Some(next) = self.next_phys(b) {
                if Self::is_free(next) {
                    self.remove_free(next);
                    Self::set_size(b, Self::block_size(b) + Self::block_size(next));
                }
            }
            if let Some(next) = self.next_phys(b) {
                (*next).prev_phys = b;
            }
            self.insert_free(b);
        }
        Ok(())
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return unsafe { self.malloc(new_size) };
        }
        if new_size == 0 {
            let _ = unsafe { self.free(ptr) };
            return None;
        }
        let b = unsafe { self.block_of(ptr).ok()? };
        let need = adjust_request(new_size)?;
        unsafe {
            let cur = Self::block_size(b);
            if need <= cur {
                self.used_bytes -= self.trim(b, need);
                return NonNull::new(ptr);
            }

            if let Some(next) = self.next_phys(b) {
                let next_size = Self::block_size(next);
                if Self::is_free(next) && cur + next_size >= need {
                    self.remove_free(next);
                    Self::set_size(b, cur + next_size);
                    if let Some(after) = self.next_phys(b) {
                        (*after).prev_phys = b;
                    }
                    self.used_bytes += next_size;
                    self.used_bytes -= self.trim(b, need);
                    return NonNull::new(ptr);
                }
            }

            let moved = self.malloc(new_size)?;
            ptr::copy_nonoverlapping(ptr, moved.as_ptr(), cur - OVERHEAD);
            let _ = self.free(ptr);
            Some(moved)
        }
    }

    fn stats(&self) -> HeapStats {
        let mut largest = 0;
        if self.fl_bitmap != 0 {
            let fl = (31 - self.fl_bitmap.leading_zeros()) as usize;
            let sl = (31 - self.sl_bitmap[fl].leading_zeros()) as usize;
            let mut b = self.heads[fl][sl];
            while !b.is_null() {
                // Safety: free-list entries are live headers inside the pool.
                unsafe {
                    largest = largest.max(Self::block_size(b));
                    b = (*b).next_free;
                }
            }
        }
        HeapStats {
            total: self.end - self.start,
            used: self.used_bytes,
            free: self.free_bytes,
            largest_free: largest,
            fragments: self.free_blocks,
            used_blocks: self.used_blocks,
        }
    }

    #[inline]
    fn in_pool(&self, p: *mut BlockHeader) -> bool {
        let a = p as usize;
        a >= self.start && a < self.end && a % ALIGN == 0
    }

    fn check_integrity(&self) -> Result<(), IntegrityError> {
        if !self.initialized() {
            return Err(IntegrityError::Uninitialized);
        }

        // Physical walk.
        let (mut phys_free, mut phys_free_n) = (0usize, 0usize);
        let (mut phys_used, mut phys_used_n) = (0usize, 0usize);
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut prev_was_free = false;
        let mut cur = self.start;
        while cur < self.end {
            let b = cur as *mut BlockHeader;
            // Safety: `cur` stays inside the pool; every step checks the
            // size before trusting it to find the next header.
            unsafe {
                let raw = (*b).size;
                if cur % ALIGN != 0 || raw & (ALIGN - 1) & !FREE_BIT != 0 {
                    return Err(IntegrityError::MisalignedHeader(cur));
                }
                let size = Self::block_size(b);
                if size < MIN_BLOCK {
                    return Err(IntegrityError::UndersizedBlock(cur));
                }
                if size > self.end - cur {
                    return Err(IntegrityError::BlockOutOfBounds(cur));
                }
                if (*b).prev_phys != prev {
                    return Err(IntegrityError::BrokenBackLink(cur));
                }
                let free = Self::is_free(b);
                if free {
                    if prev_was_free {
                        return Err(IntegrityError::AdjacentFree(prev as usize));
                    }
                    for link in [(*b).next_free, (*b).prev_free] {
                        if !link.is_null() && !self.in_pool(link) {
                            return Err(IntegrityError::FreeLinkOutOfBounds(link as usize));
                        }
                    }
                    phys_free += size;
                    phys_free_n += 1;
                } else {
                    phys_used += size;
                    phys_used_n += 1;
                }
                prev_was_free = free;
                prev = b;
                cur += size;
            }
        }

        // Logical walk over every bucket.
        let max_blocks = (self.end - self.start) / MIN_BLOCK;
        let (mut log_free, mut log_free_n) = (0usize, 0usize);
        for fl in 0..FL_COUNT {
            let fl_bit = self.fl_bitmap & (1 << fl) != 0;
            if fl_bit != (self.sl_bitmap[fl] != 0) {
                return Err(IntegrityError::BitmapMismatch(fl, SL_COUNT));
            }
            for sl in 0..SL_COUNT {
                let head = self.heads[fl][sl];
                let sl_bit = self.sl_bitmap[fl] & (1 << sl) != 0;
                if sl_bit != !head.is_null() {
                    return Err(IntegrityError::BitmapMismatch(fl, sl));
                }
                let mut back: *mut BlockHeader = ptr::null_mut();
                let mut b = head;
                let mut seen = 0;
                while !b.is_null() {
                    if !self.in_pool(b) {
                        return Err(IntegrityError::FreeLinkOutOfBounds(b as usize));
                    }
                    seen += 1;
                    if seen > max_blocks {
                        return Err(IntegrityError::FreeLinkMismatch(b as usize));
                    }
                    // Safety: `b` was just checked to lie inside the pool.
                    unsafe {
                        if !Self::is_free(b) {
                            return Err(IntegrityError::NotMarkedFree(b as usize));
                        }
                        let size = Self::block_size(b);
                        if size < MIN_BLOCK || size > self.end - b as usize {
                            return Err(IntegrityError::BlockOutOfBounds(b as usize));
                        }
                        if mapping(size) != (fl, sl) {
                            return Err(IntegrityError::WrongBucket(b as usize));
                        }
                        if (*b).prev_free != back {
                            return Err(IntegrityError::FreeLinkMismatch(b as usize));
                        }
                        log_free += size;
                        log_free_n += 1;
                        back = b;
                        b = (*b).next_free;
                    }
                }
            }
        }

        let consistent = phys_free == log_free
            && phys_free_n == log_free_n
            && phys_free == self.free_bytes
            && phys_free_n == self.free_blocks
            && phys_used == self.used_bytes
            && phys_used_n == self.used_blocks;
        if !consistent {
            return Err(IntegrityError::CounterMismatch);
        }
        Ok(())
    }
}

/// The kernel heap: a [`Tlsf`] control block behind its own lock.
///
/// The heap lock is independent of every scheduler lock and is never held
/// across a yield.
pub struct Heap {
    inner: IrqLock<Tlsf>,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            inner: IrqLock::new(Tlsf::new()),
        }
    }

    /// Hand the region `[start, start + size)` to the allocator, replacing
    /// any previous pool. The region is trimmed to `ALIGN`.
    ///
    /// # Safety
    /// The region must be valid for reads and writes, unused by anything
    /// else, and outlive every allocation made from it.
    pub unsafe fn init(&self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let result = unsafe { self.inner.lock().init(start as usize, size) };
        if result.is_ok() {
            log::debug!("heap: {} bytes at {:p}", size, start);
        }
        result
    }

    /// Safe wrapper over [`Heap::init`] for a buffer with static lifetime.
    pub fn init_static(&self, pool: &'static mut [u8]) -> Result<(), HeapError> {
        // Safety: the exclusive 'static borrow guarantees the requirements.
        unsafe { self.init(pool.as_mut_ptr(), pool.len()) }
    }

    /// Allocate `size` bytes aligned to [`ALIGN`]. `None` when the request
    /// is zero, too large, or no free block fits.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        // Safety: the control block only hands out blocks from its pool.
        unsafe { self.inner.lock().malloc(size) }
    }

    /// Return a block to the pool, coalescing it with free neighbours.
    ///
    /// # Safety
    /// `ptr` must have come from this heap and must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        unsafe { self.inner.lock().free(ptr) }
    }

    /// Resize a block, in place when possible. On failure the original block
    /// is left untouched and `None` is returned.
    ///
    /// # Safety
    /// Same as [`Heap::free`]; on success the old pointer is invalidated.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        unsafe { self.inner.lock().realloc(ptr, new_size) }
    }

    /// Whether `ptr` lies inside the managed pool.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let t = self.inner.lock();
        let a = ptr as usize;
        t.initialized() && a >= t.start && a < t.end
    }

    /// Payload capacity of an allocated block.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let t = self.inner.lock();
        unsafe {
            let b = t.block_of(ptr).ok()?;
            Some(Tlsf::block_size(b) - OVERHEAD)
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    /// Cross-check the physical block chain, the bucket table and the
    /// running counters.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        self.inner.lock().check_integrity()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        self.malloc(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = unsafe { self.free(ptr) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        let moved = unsafe { Heap::realloc(self, ptr, new_size) };
        moved.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with_pool(size: usize) -> Heap {
        let pool: &'static mut [u64] = Box::leak(vec![0u64; size / 8].into_boxed_slice());
        let heap = Heap::new();
        unsafe { heap.init(pool.as_mut_ptr() as *mut u8, size).unwrap() };
        heap
    }

    fn header(p: NonNull<u8>) -> *mut BlockHeader {
        unsafe { p.as_ptr().sub(OVERHEAD) as *mut BlockHeader }
    }

    #[test]
    fn test_mapping_rounds_up_to_bucket() {
        for size in (MIN_BLOCK..8192).step_by(ALIGN) {
            let (fl, sl) = mapping_search(size);
            // Smallest size filed in the chosen bucket must cover the request.
            let lower = if fl == 0 {
                sl * ALIGN
            } else {
                let f = fl as u32 + FL_SHIFT - 1;
                (1 << f) + (sl << (f - SL_LOG2))
            };
            assert!(lower >= size, "size {} -> ({}, {}) lower {}", size, fl, sl, lower);
            assert_eq!(mapping(lower), (fl, sl));
        }
    }

    #[test]
    fn test_fresh_pool_is_one_free_block() {
        let heap = heap_with_pool(4096);
        let s = heap.stats();
        assert_eq!(s.total, 4096);
        assert_eq!(s.free, 4096);
        assert_eq!(s.largest_free, 4096);
        assert_eq!(s.fragments, 1);
        assert_eq!(s.used, 0);
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_exact_fill_then_exhaustion() {
        let heap = heap_with_pool(4096);
        let big = heap.malloc(4064).expect("whole pool");
        assert_eq!(heap.stats().fragments, 0);
        assert!(heap.malloc(1).is_none());
        unsafe { heap.free(big.as_ptr()).unwrap() };
        assert!(heap.malloc(1).is_some());
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_free_then_malloc_same_size_reuses_address() {
        let heap = heap_with_pool(8192);
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(200).unwrap();
        let c = heap.malloc(300).unwrap();
        unsafe { heap.free(b.as_ptr()).unwrap() };
        let b2 = heap.malloc(200).unwrap();
        assert_eq!(b, b2);

        unsafe { heap.free(c.as_ptr()).unwrap() };
        let c2 = heap.malloc(300).unwrap();
        assert_eq!(c, c2);
        let _ = a;
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let heap = heap_with_pool(4096);
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let c = heap.malloc(64).unwrap();
        let _guard = heap.malloc(64).unwrap();
        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(c.as_ptr()).unwrap();
        }
        assert_eq!(heap.stats().fragments, 3);
        unsafe { heap.free(b.as_ptr()).unwrap() };
        // a+b+c merged, plus the tail after the guard block.
        assert_eq!(heap.stats().fragments, 2);
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_free_rejects_bad_pointers() {
        let heap = heap_with_pool(1024);
        let p = heap.malloc(32).unwrap();
        let mut outside = 0u64;
        unsafe {
            assert_eq!(heap.free(ptr::null_mut()), Err(HeapError::NullPointer));
            assert_eq!(
                heap.free(&mut outside as *mut u64 as *mut u8),
                Err(HeapError::OutOfRange)
            );
            assert_eq!(heap.free(p.as_ptr().add(8)), Err(HeapError::NotAllocated));
            heap.free(p.as_ptr()).unwrap();
            assert_eq!(heap.free(p.as_ptr()), Err(HeapError::NotAllocated));
        }
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_zero_and_oversized_requests() {
        let heap = heap_with_pool(1024);
        assert!(heap.malloc(0).is_none());
        assert!(heap.malloc(usize::MAX).is_none());
        assert!(heap.malloc(2048).is_none());
        assert_eq!(heap.stats().used, 0);
    }

    #[test]
    fn test_uninitialized_heap() {
        let heap = Heap::new();
        assert!(heap.malloc(8).is_none());
        assert_eq!(heap.check_integrity(), Err(IntegrityError::Uninitialized));
        assert!(!heap.contains(0x1000 as *const u8));
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        let heap = heap_with_pool(4096);
        let p = heap.malloc(512).unwrap();
        let q = unsafe { heap.realloc(p.as_ptr(), 64) }.unwrap();
        assert_eq!(p, q);
        assert_eq!(unsafe { heap.usable_size(q.as_ptr()) }, Some(64));
        assert_eq!(heap.stats().used, 64 + OVERHEAD);
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_realloc_grows_into_free_neighbour() {
        let heap = heap_with_pool(4096);
        let p = heap.malloc(64).unwrap();
        let q = unsafe { heap.realloc(p.as_ptr(), 1024) }.unwrap();
        assert_eq!(p, q);
        assert!(unsafe { heap.usable_size(q.as_ptr()) }.unwrap() >= 1024);
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_realloc_moves_and_preserves_contents() {
        let heap = heap_with_pool(4096);
        let p = heap.malloc(64).unwrap();
        let _blocker = heap.malloc(64).unwrap();
        unsafe {
            for i in 0..64 {
                *p.as_ptr().add(i) = i as u8;
            }
            let q = heap.realloc(p.as_ptr(), 256).unwrap();
            assert_ne!(p, q);
            for i in 0..64 {
                assert_eq!(*q.as_ptr().add(i), i as u8);
            }
        }
        assert_eq!(heap.stats().used_blocks, 2);
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_realloc_failure_keeps_original() {
        let heap = heap_with_pool(1024);
        let p = heap.malloc(64).unwrap();
        let _blocker = heap.malloc(64).unwrap();
        assert!(unsafe { heap.realloc(p.as_ptr(), 4096) }.is_none());
        assert_eq!(unsafe { heap.usable_size(p.as_ptr()) }, Some(64));
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_corrupt_alignment_bits_detected() {
        let heap = heap_with_pool(2048);
        let p = heap.malloc(64).unwrap();
        unsafe { (*header(p)).size |= 0b100 };
        assert_eq!(
            heap.check_integrity().map_err(|e| e.code()),
            Err(IntegrityError::MisalignedHeader(0).code())
        );
    }

    #[test]
    fn test_corrupt_size_past_end_detected() {
        let heap = heap_with_pool(2048);
        let p = heap.malloc(64).unwrap();
        unsafe { (*header(p)).size = 4096 };
        assert_eq!(
            heap.check_integrity().map_err(|e| e.code()),
            Err(IntegrityError::BlockOutOfBounds(0).code())
        );
    }

    #[test]
    fn test_corrupt_back_link_detected() {
        let heap = heap_with_pool(2048);
        let _a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        unsafe { (*header(b)).prev_phys = header(b) };
        assert_eq!(
            heap.check_integrity().map_err(|e| e.code()),
            Err(IntegrityError::BrokenBackLink(0).code())
        );
    }

    #[test]
    fn test_free_rejects_misaligned_back_link() {
        let heap = heap_with_pool(2048);
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        unsafe {
            let skewed = (header(a) as usize + 3) as *mut BlockHeader;
            (*header(b)).prev_phys = skewed;
            assert_eq!(heap.free(b.as_ptr()), Err(HeapError::NotAllocated));
            (*header(b)).prev_phys = header(a);
            heap.free(b.as_ptr()).unwrap();
        }
        assert_eq!(heap.check_integrity(), Ok(()));
    }

    #[test]
    fn test_corruption_codes_are_distinct() {
        let codes = [
            IntegrityError::MisalignedHeader(0).code(),
            IntegrityError::BlockOutOfBounds(0).code(),
            IntegrityError::BrokenBackLink(0).code(),
        ];
        assert!(codes.iter().all(|&c| c != 0));
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[0], codes[2]);
    }

    #[test]
    fn test_random_sequence_keeps_integrity() {
        let heap = heap_with_pool(16 * 1024);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut seed = 0x1234_5678u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        for _ in 0..2000 {
            let r = next();
            match r % 3 {
                0 | 1 => {
                    let size = (next() % 700 + 1) as usize;
                    if let Some(p) = heap.malloc(size) {
                        live.push((p, size));
                    }
                }
                _ if !live.is_empty() => {
                    let idx = next() as usize % live.len();
                    let (p, _) = live.swap_remove(idx);
                    unsafe { heap.free(p.as_ptr()).unwrap() };
                }
                _ => {}
            }
            assert_eq!(heap.check_integrity(), Ok(()));
        }
        for (p, _) in live.drain(..) {
            unsafe { heap.free(p.as_ptr()).unwrap() };
        }
        let s = heap.stats();
        assert_eq!(s.fragments, 1);
        assert_eq!(s.free, s.total);
    }

    #[test]
    fn test_contains_tracks_pool_bounds() {
        let heap = heap_with_pool(1024);
        let p = heap.malloc(16).unwrap();
        assert!(heap.contains(p.as_ptr()));
        let local = 0u8;
        assert!(!heap.contains(&local));
    }

    #[test]
    fn test_global_alloc_rejects_large_alignment() {
        let heap = heap_with_pool(1024);
        let layout = Layout::from_size_align(64, 64).unwrap();
        assert!(unsafe { GlobalAlloc::alloc(&heap, layout) }.is_null());
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = unsafe { GlobalAlloc::alloc(&heap, layout) };
        assert!(!p.is_null());
        unsafe { GlobalAlloc::dealloc(&heap, p, layout) };
        assert_eq!(heap.stats().used, 0);
    }
}
