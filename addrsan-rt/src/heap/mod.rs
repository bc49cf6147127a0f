//! The redzone-wrapping heap allocator behind the interposed malloc family.
//!
//! Every live chunk is laid out as
//!
//! ```text
//! [ left redzone >= redzone | header | user bytes | right redzone >= redzone ]
//! ```
//!
//! with the header immediately before the user region and both redzones
//! poisoned in shadow for the chunk's whole live span. Freed chunks are
//! stamped `HEAP_FREED` over their entire span and routed through a FIFO
//! quarantine before the memory can be handed out again.
//!
//! Chunks come from power-of-two size classes, each a lock-protected free
//! list carved out of mmapped regions; user sizes at or above the
//! `large_malloc` threshold get their own mapping instead.

mod quarantine;

use addrsan_shared::mapping::SHADOW_GRANULARITY;
use addrsan_shared::poison::{HEAP_FREED, HEAP_LEFT_RZ, HEAP_RIGHT_RZ};
use core::fmt::Write;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::mutex::SpinMutex;

use crate::global::{BHashMap, GlobalCtx};
use crate::hooks::RtAlloc;
use crate::shadow::{poison_region, unpoison_region};
use crate::stack_trace;
use crate::stats::AsanStats;
use crate::utils::{check, mmap_anon, page_size, raw_munmap, round_up_to, verbose};

pub const NUM_SIZE_CLASSES: usize = usize::BITS as usize;

const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

/// Size classes below this are served from carved regions of at least this
/// many bytes; larger classes get one chunk per mapping.
const SIZE_CLASS_REGION: usize = 1 << 20;

/// `size_class` value marking a chunk with its own dedicated mapping.
const DIRECT_MMAP_CLASS: u32 = u32::MAX;

pub(crate) const CHUNK_ALLOCATED: u32 = 0x3204;
pub(crate) const CHUNK_QUARANTINED: u32 = 0x1978;
pub(crate) const CHUNK_AVAILABLE: u32 = 0x573B;

/// Metadata preceding every user region. 8-aligned; the shadow over the
/// header is part of the left redzone, so instrumented code cannot touch it.
#[repr(C, align(8))]
#[derive(Debug)]
pub(crate) struct ChunkHeader {
    pub(crate) state: AtomicU32,
    pub(crate) size_class: u32,
    pub(crate) user_size: usize,
    pub(crate) alignment: usize,
    pub(crate) chunk_beg: usize,
    pub(crate) total_size: usize,
    pub(crate) alloc_tid: u32,
    pub(crate) free_tid: u32,
    pub(crate) alloc_stack: u32,
    pub(crate) free_stack: u32,
    pub(crate) next: Option<NonNull<ChunkHeader>>,
}

impl ChunkHeader {
    pub(crate) fn user_beg(&self) -> usize {
        self as *const ChunkHeader as usize + HEADER_SIZE
    }

    pub(crate) fn user_end(&self) -> usize {
        self.user_beg() + self.user_size
    }

    pub(crate) fn chunk_end(&self) -> usize {
        self.chunk_beg + self.total_size
    }

    fn span_contains(&self, addr: usize) -> bool {
        addr >= self.chunk_beg && addr < self.chunk_end()
    }
}

/// Free-list node written over the first word of an available chunk.
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ChunkPtr(NonNull<ChunkHeader>);

unsafe impl Send for ChunkPtr {}

#[derive(Debug)]
struct SizeClass {
    free: SpinMutex<Option<NonNull<FreeNode>>>,
}

unsafe impl Send for SizeClass {}
unsafe impl Sync for SizeClass {}

impl SizeClass {
    const fn new() -> SizeClass {
        SizeClass { free: SpinMutex::new(None) }
    }
}

/// Outcome of validating a pointer handed to `free`/`realloc`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FreeClass {
    /// A live chunk; its state has already been flipped to quarantined so a
    /// racing free of the same pointer classifies as a double free.
    Live(NonNull<ChunkHeader>),
    /// Already freed and still quarantined: double free.
    Quarantined(NonNull<ChunkHeader>),
    /// Not the user-start of any chunk we know: invalid free.
    Unknown,
}

#[derive(Debug)]
pub struct HeapAllocator {
    classes: [SizeClass; NUM_SIZE_CLASSES],
    quarantine: quarantine::Quarantine,
    /// user_beg -> header, for every live or quarantined chunk. There is at
    /// most one chunk per user_beg at any time.
    chunks: SpinMutex<BHashMap<usize, ChunkPtr>>,
}

impl HeapAllocator {
    pub fn new(alloc: RtAlloc) -> HeapAllocator {
        HeapAllocator {
            classes: [const { SizeClass::new() }; NUM_SIZE_CLASSES],
            quarantine: quarantine::Quarantine::new(),
            chunks: SpinMutex::new(BHashMap::new_in(alloc)),
        }
    }

    /// Allocates `size` user bytes at the given alignment. Returns null on
    /// resource exhaustion, matching the contract of the wrapped symbols.
    pub fn allocate(&self, ctx: &GlobalCtx, size: usize, alignment: usize) -> *mut u8 {
        let flags = ctx.flags();
        let alignment = alignment.max(SHADOW_GRANULARITY);
        check!(alignment.is_power_of_two());
        if size > isize::MAX as usize {
            return core::ptr::null_mut();
        }

        // Left redzone + header + alignment slop + granule-rounded user
        // bytes + right redzone.
        let Some(needed) = flags
            .redzone
            .checked_add(HEADER_SIZE + alignment)
            .and_then(|n| n.checked_add(round_up_to(size, SHADOW_GRANULARITY)))
            .and_then(|n| n.checked_add(flags.redzone))
        else {
            return core::ptr::null_mut();
        };

        let trace = stack_trace::capture_here(ctx, flags.malloc_context_size);
        let alloc_stack = ctx.depot().store(&trace);
        let alloc_tid = crate::thread::current_tid(ctx);

        let (chunk_beg, chunk_size, class) = if size >= flags.large_malloc {
            AsanStats::bump(&ctx.stats().malloc_large, 1);
            match self.direct_chunk(ctx, needed) {
                Some(chunk) => chunk,
                None => return core::ptr::null_mut(),
            }
        } else {
            match self.classed_chunk(ctx, needed) {
                Some(chunk) => chunk,
                None => return core::ptr::null_mut(),
            }
        };

        self.place_chunk(ctx, chunk_beg, chunk_size, class, size, alignment, alloc_tid, alloc_stack)
    }

    pub fn calloc(&self, ctx: &GlobalCtx, nmemb: usize, size: usize) -> *mut u8 {
        let Some(bytes) = nmemb.checked_mul(size) else {
            return core::ptr::null_mut();
        };
        let ptr = self.allocate(ctx, bytes, SHADOW_GRANULARITY);
        if !ptr.is_null() {
            unsafe { core::ptr::write_bytes(ptr, 0, bytes) };
        }
        ptr
    }

    /// alloc + copy + free. The old pointer is left untouched if the new
    /// allocation fails.
    pub fn realloc(&self, ctx: &GlobalCtx, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(ctx, size, SHADOW_GRANULARITY);
        }
        AsanStats::bump(&ctx.stats().reallocs, 1);
        AsanStats::bump(&ctx.stats().realloced, size);
        let live_size = {
            let chunks = self.chunks.lock();
            chunks.get(&(ptr as usize)).map(|chunk| {
                let header = unsafe { chunk.0.as_ref() };
                (header.state.load(Ordering::Relaxed), header.user_size)
            })
        };
        let old_size = match live_size {
            Some((CHUNK_ALLOCATED, user_size)) => user_size,
            _ => crate::report::report_free_error(ctx, "attempting realloc", ptr as usize),
        };
        let new_ptr = self.allocate(ctx, size, SHADOW_GRANULARITY);
        if new_ptr.is_null() {
            return new_ptr;
        }
        unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size)) };
        self.free(ctx, ptr);
        new_ptr
    }

    /// Releases a pointer previously returned by [`HeapAllocator::allocate`].
    /// Anything else is terminal.
    pub fn free(&self, ctx: &GlobalCtx, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.begin_free(ptr as usize) {
            FreeClass::Live(chunk) => self.quarantine_chunk(ctx, chunk),
            FreeClass::Quarantined(_) => {
                crate::report::report_free_error(ctx, "attempting double-free", ptr as usize)
            }
            FreeClass::Unknown => {
                crate::report::report_free_error(ctx, "attempting free on unallocated", ptr as usize)
            }
        }
    }

    /// Validates `ptr` as a freeable chunk start and, when it is, claims it:
    /// the live -> quarantined transition happens under the index lock so
    /// exactly one of two racing frees wins.
    pub(crate) fn begin_free(&self, addr: usize) -> FreeClass {
        let chunks = self.chunks.lock();
        let Some(chunk) = chunks.get(&addr) else {
            return FreeClass::Unknown;
        };
        let header = unsafe { chunk.0.as_ref() };
        check!(header.user_beg() == addr);
        match header.state.load(Ordering::Relaxed) {
            CHUNK_ALLOCATED => {
                header.state.store(CHUNK_QUARANTINED, Ordering::Relaxed);
                FreeClass::Live(chunk.0)
            }
            CHUNK_QUARANTINED => FreeClass::Quarantined(chunk.0),
            _ => FreeClass::Unknown,
        }
    }

    fn quarantine_chunk(&self, ctx: &GlobalCtx, mut chunk: NonNull<ChunkHeader>) {
        let flags = ctx.flags();
        let trace = stack_trace::capture_here(ctx, flags.malloc_context_size);
        {
            let header = unsafe { chunk.as_mut() };
            header.free_stack = ctx.depot().store(&trace);
            header.free_tid = crate::thread::current_tid(ctx);
        }
        let header = unsafe { chunk.as_ref() };
        // The whole span, user bytes included, reads as freed from now on.
        poison_region(ctx, header.chunk_beg, header.total_size, HEAP_FREED);

        AsanStats::bump(&ctx.stats().frees, 1);
        AsanStats::bump(&ctx.stats().freed, header.user_size);
        AsanStats::bump(&ctx.stats().freed_by_size[stats_class(header.total_size)], 1);

        self.quarantine.push(chunk, flags.quarantine_size, |old| {
            self.really_release(ctx, old);
        });
    }

    /// True release once a chunk has aged out of quarantine: drop it from the
    /// index and return the memory to its size class (or the OS).
    fn really_release(&self, ctx: &GlobalCtx, chunk: NonNull<ChunkHeader>) {
        let header = unsafe { chunk.as_ref() };
        let removed = self.chunks.lock().remove(&header.user_beg());
        check!(removed.is_some());

        AsanStats::bump(&ctx.stats().real_frees, 1);
        AsanStats::bump(&ctx.stats().really_freed, header.user_size);
        AsanStats::bump(&ctx.stats().really_freed_by_size[stats_class(header.total_size)], 1);

        if header.size_class == DIRECT_MMAP_CLASS {
            unsafe { raw_munmap(header.chunk_beg as *mut u8, header.total_size) };
            return;
        }
        header.state.store(CHUNK_AVAILABLE, Ordering::Relaxed);
        let node = header.chunk_beg as *mut FreeNode;
        let mut free = self.classes[header.size_class as usize].free.lock();
        unsafe { node.write(FreeNode { next: *free }) };
        *free = NonNull::new(node);
    }

    /// Bytes currently held poisoned in the quarantine.
    pub fn quarantined_bytes(&self) -> usize {
        self.quarantine.bytes()
    }

    fn classed_chunk(&self, ctx: &GlobalCtx, needed: usize) -> Option<(usize, usize, u32)> {
        let class = size_class_for(needed);
        check!(class < NUM_SIZE_CLASSES);
        let chunk_size = 1usize << class;

        let mut free = self.classes[class].free.lock();
        if free.is_none() {
            *free = self.refill_class(ctx, class)?;
        }
        let node = (*free)?;
        *free = unsafe { node.as_ref().next };
        Some((node.as_ptr() as usize, chunk_size, class as u32))
    }

    /// Maps a fresh region and threads it onto the class free list, returning
    /// the new list head.
    fn refill_class(&self, ctx: &GlobalCtx, class: usize) -> Option<Option<NonNull<FreeNode>>> {
        let chunk_size = 1usize << class;
        let region_size = chunk_size.max(SIZE_CLASS_REGION);
        let region = unsafe { mmap_anon(region_size, "size class region") }.ok()? as usize;

        AsanStats::bump(&ctx.stats().mmaps, 1);
        AsanStats::bump(&ctx.stats().mmaped, region_size);
        AsanStats::bump(&ctx.stats().mmaped_by_size[class], 1);
        verbose!(ctx, 2, "addrsan: refilled size class {} with {:#x} bytes", class, region_size);

        let mut head: Option<NonNull<FreeNode>> = None;
        for i in (0..region_size / chunk_size).rev() {
            let node = (region + i * chunk_size) as *mut FreeNode;
            unsafe { node.write(FreeNode { next: head }) };
            head = NonNull::new(node);
        }
        Some(head)
    }

    fn direct_chunk(&self, ctx: &GlobalCtx, needed: usize) -> Option<(usize, usize, u32)> {
        let total = round_up_to(needed, page_size());
        let beg = unsafe { mmap_anon(total, "large chunk") }.ok()? as usize;
        AsanStats::bump(&ctx.stats().mmaps, 1);
        AsanStats::bump(&ctx.stats().mmaped, total);
        AsanStats::bump(&ctx.stats().mmaped_by_size[stats_class(total)], 1);
        Some((beg, total, DIRECT_MMAP_CLASS))
    }

    /// Writes the header, stamps the shadow, and publishes the chunk. The
    /// redzones are poisoned before the pointer escapes, which is the only
    /// ordering the shadow protocol requires.
    #[allow(clippy::too_many_arguments)]
    fn place_chunk(
        &self,
        ctx: &GlobalCtx,
        chunk_beg: usize,
        chunk_size: usize,
        class: u32,
        size: usize,
        alignment: usize,
        alloc_tid: u32,
        alloc_stack: u32,
    ) -> *mut u8 {
        let flags = ctx.flags();
        let user_beg = round_up_to(chunk_beg + flags.redzone + HEADER_SIZE, alignment);
        let user_end = user_beg + size;
        let chunk_end = chunk_beg + chunk_size;
        check!(round_up_to(user_end, SHADOW_GRANULARITY) + flags.redzone <= chunk_end);

        let header = (user_beg - HEADER_SIZE) as *mut ChunkHeader;
        unsafe {
            header.write(ChunkHeader {
                state: AtomicU32::new(CHUNK_ALLOCATED),
                size_class: class,
                user_size: size,
                alignment,
                chunk_beg,
                total_size: chunk_size,
                alloc_tid,
                free_tid: 0,
                alloc_stack,
                free_stack: 0,
                next: None,
            });
        }

        poison_region(ctx, chunk_beg, user_beg - chunk_beg, HEAP_LEFT_RZ);
        unpoison_region(ctx, user_beg, size);
        let right_beg = round_up_to(user_end, SHADOW_GRANULARITY);
        poison_region(ctx, right_beg, chunk_end - right_beg, HEAP_RIGHT_RZ);

        AsanStats::bump(&ctx.stats().mallocs, 1);
        AsanStats::bump(&ctx.stats().malloced, size);
        AsanStats::bump(&ctx.stats().malloced_redzones, chunk_size - size);
        AsanStats::bump(&ctx.stats().malloced_by_size[stats_class(chunk_size)], 1);

        let previous =
            self.chunks.lock().insert(user_beg, ChunkPtr(unsafe { NonNull::new_unchecked(header) }));
        check!(previous.is_none());

        user_beg as *mut u8
    }

    /// Heap leg of the address-description cascade: find the chunk whose span
    /// (redzones included) covers `addr` and retell its history.
    pub fn describe_addr(
        &self,
        ctx: &GlobalCtx,
        addr: usize,
        access_size: usize,
        out: &mut dyn Write,
    ) -> bool {
        let Some(chunks) = self.chunks.try_lock() else {
            let _ = writeln!(out, "  (heap index busy, description skipped)");
            return false;
        };
        let access_end = addr.saturating_add(access_size.max(1));
        let Some(chunk) = chunks
            .values()
            .map(|c| unsafe { c.0.as_ref() })
            .find(|h| h.span_contains(addr) || (addr < h.chunk_beg && access_end > h.chunk_beg))
        else {
            return false;
        };

        let _ = write!(out, "{:#x} is located ", addr);
        if addr < chunk.user_beg() {
            let _ = write!(out, "{} bytes to the left", chunk.user_beg() - addr);
        } else if addr >= chunk.user_end() {
            let _ = write!(out, "{} bytes to the right", addr - chunk.user_end());
        } else {
            let _ = write!(out, "{} bytes inside", addr - chunk.user_beg());
        }
        let _ = writeln!(
            out,
            " of {}-byte region [{:#x},{:#x})",
            chunk.user_size,
            chunk.user_beg(),
            chunk.user_end()
        );

        if chunk.state.load(Ordering::Relaxed) == CHUNK_QUARANTINED {
            let _ = writeln!(out, "freed by thread T{} here:", chunk.free_tid);
            write_stack(ctx, chunk.free_stack, out);
            let _ = writeln!(out, "previously allocated by thread T{} here:", chunk.alloc_tid);
        } else {
            let _ = writeln!(out, "allocated by thread T{} here:", chunk.alloc_tid);
        }
        write_stack(ctx, chunk.alloc_stack, out);
        true
    }
}

fn write_stack(ctx: &GlobalCtx, stack_id: u32, out: &mut dyn Write) {
    match ctx.depot().get(stack_id) {
        Some(trace) => {
            for (i, pc) in trace.frames().iter().enumerate() {
                let _ = writeln!(out, "    #{} {:#x}", i, pc);
            }
        }
        None => {
            let _ = writeln!(out, "    <stack unavailable>");
        }
    }
}

/// Smallest power-of-two class that fits `bytes`.
fn size_class_for(bytes: usize) -> usize {
    (usize::BITS - bytes.saturating_sub(1).leading_zeros()) as usize
}

/// Class index used for the by-size statistics arrays.
fn stats_class(bytes: usize) -> usize {
    size_class_for(bytes).min(NUM_SIZE_CLASSES - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::test_ctx;
    use crate::shadow::shadow_byte;
    use addrsan_shared::poison::is_partial;
    use alloc::string::String;

    fn header_of(ctx: &GlobalCtx, ptr: *mut u8) -> &'static ChunkHeader {
        let chunks = ctx.heap().chunks.lock();
        let chunk = chunks.get(&(ptr as usize)).copied().unwrap();
        unsafe { chunk.0.as_ref() }
    }

    #[test]
    fn live_chunk_satisfies_shadow_invariants() {
        let ctx = test_ctx();
        let size = 10;
        let ptr = ctx.heap().allocate(ctx, size, 8);
        assert!(!ptr.is_null());
        let beg = ptr as usize;

        // User prefix addressable, boundary granule partial, right redzone
        // poisoned, left redzone poisoned.
        assert_eq!(shadow_byte(beg), 0);
        assert_eq!(shadow_byte(beg + 8), (size % 8) as u8);
        assert_eq!(shadow_byte(beg + 16), HEAP_RIGHT_RZ);
        assert_eq!(shadow_byte(beg - 8), HEAP_LEFT_RZ);
        assert_eq!(shadow_byte(beg - ctx.flags().redzone), HEAP_LEFT_RZ);

        // The region is really usable memory.
        unsafe {
            for i in 0..size {
                ptr.add(i).write(i as u8);
            }
            for i in 0..size {
                assert_eq!(ptr.add(i).read(), i as u8);
            }
        }
        let header = header_of(ctx, ptr);
        assert_eq!(header.user_size, size);
        assert_eq!(header.state.load(Ordering::Relaxed), CHUNK_ALLOCATED);
        ctx.heap().free(ctx, ptr);
    }

    #[test]
    fn granule_multiple_size_has_no_partial_byte() {
        let ctx = test_ctx();
        let ptr = ctx.heap().allocate(ctx, 16, 8);
        let beg = ptr as usize;
        assert_eq!(shadow_byte(beg), 0);
        assert_eq!(shadow_byte(beg + 8), 0);
        assert_eq!(shadow_byte(beg + 16), HEAP_RIGHT_RZ);
        ctx.heap().free(ctx, ptr);
    }

    #[test]
    fn freed_chunk_is_stamped_over_its_whole_span() {
        let ctx = test_ctx();
        let ptr = ctx.heap().allocate(ctx, 40, 8);
        let header = header_of(ctx, ptr);
        let (chunk_beg, total) = (header.chunk_beg, header.total_size);
        ctx.heap().free(ctx, ptr);

        for offset in (0..total).step_by(8) {
            assert_eq!(shadow_byte(chunk_beg + offset), HEAP_FREED, "offset {offset}");
        }
        assert_eq!(header.state.load(Ordering::Relaxed), CHUNK_QUARANTINED);
        assert!(ctx.heap().quarantined_bytes() >= total);
    }

    #[test]
    fn malloc_zero_returns_unique_guarded_pointers() {
        let ctx = test_ctx();
        let a = ctx.heap().allocate(ctx, 0, 8);
        let b = ctx.heap().allocate(ctx, 0, 8);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        // Zero addressable bytes: the very first byte reads as right redzone.
        assert_eq!(shadow_byte(a as usize), HEAP_RIGHT_RZ);
        ctx.heap().free(ctx, a);
        ctx.heap().free(ctx, b);
    }

    #[test]
    fn free_classification_catches_double_and_invalid_frees() {
        let ctx = test_ctx();
        let ptr = ctx.heap().allocate(ctx, 24, 8);
        assert!(matches!(ctx.heap().begin_free(ptr as usize), FreeClass::Live(_)));
        // First classification flipped the state; a second free of the same
        // pointer is a double free.
        assert!(matches!(ctx.heap().begin_free(ptr as usize), FreeClass::Quarantined(_)));
        // Mid-chunk and foreign pointers are invalid frees.
        assert!(matches!(ctx.heap().begin_free(ptr as usize + 1), FreeClass::Unknown));
        assert!(matches!(ctx.heap().begin_free(0x1234), FreeClass::Unknown));
    }

    #[test]
    fn realloc_moves_data_and_retires_the_old_chunk() {
        let ctx = test_ctx();
        let p = ctx.heap().allocate(ctx, 17, 8);
        unsafe {
            for i in 0..17 {
                p.add(i).write(i as u8);
            }
        }
        let q = ctx.heap().realloc(ctx, p, 100);
        assert!(!q.is_null());
        assert_ne!(p, q);
        unsafe {
            for i in 0..17 {
                assert_eq!(q.add(i).read(), i as u8);
            }
        }
        // Offset 17 is addressable in the new region...
        let shadow_17 = shadow_byte(q as usize + 16);
        assert!(shadow_17 == 0 || (is_partial(shadow_17) && shadow_17 > 1));
        // ...while the old region now reads as freed.
        assert_eq!(shadow_byte(p as usize), HEAP_FREED);
        ctx.heap().free(ctx, q);
    }

    #[test]
    fn realloc_of_null_allocates() {
        let ctx = test_ctx();
        let p = ctx.heap().realloc(ctx, core::ptr::null_mut(), 32);
        assert!(!p.is_null());
        ctx.heap().free(ctx, p);
    }

    #[test]
    fn calloc_zeroes_and_guards() {
        let ctx = test_ctx();
        let p = ctx.heap().calloc(ctx, 3, 5);
        assert!(!p.is_null());
        unsafe {
            for i in 0..15 {
                assert_eq!(p.add(i).read(), 0);
            }
        }
        assert_eq!(shadow_byte(p as usize + 8), 7);
        assert!(ctx.heap().calloc(ctx, usize::MAX, 2).is_null());
        ctx.heap().free(ctx, p);
    }

    #[test]
    fn requested_alignment_is_honored() {
        let ctx = test_ctx();
        for alignment in [16usize, 64, 256, 4096] {
            let p = ctx.heap().allocate(ctx, 33, alignment);
            assert_eq!(p as usize % alignment, 0, "alignment {alignment}");
            assert_eq!(shadow_byte(p as usize - 8), HEAP_LEFT_RZ);
            ctx.heap().free(ctx, p);
        }
    }

    #[test]
    fn direct_mmap_chunks_follow_the_same_discipline() {
        let ctx = test_ctx();
        // Drive the direct path straight: the threshold itself needs 2 GiB.
        let size = 5000;
        let needed = ctx.flags().redzone * 2 + HEADER_SIZE + 8 + round_up_to(size, 8);
        let (chunk_beg, chunk_size, class) = ctx.heap().direct_chunk(ctx, needed).unwrap();
        assert_eq!(class, DIRECT_MMAP_CLASS);
        let ptr = ctx.heap().place_chunk(ctx, chunk_beg, chunk_size, class, size, 8, 0, 0);
        let beg = ptr as usize;
        assert_eq!(shadow_byte(beg), 0);
        assert_eq!(shadow_byte(beg + size), HEAP_RIGHT_RZ);
        assert_eq!(shadow_byte(beg - 8), HEAP_LEFT_RZ);
        ctx.heap().free(ctx, ptr);
        assert_eq!(shadow_byte(beg), HEAP_FREED);
    }

    #[test]
    fn describe_right_overflow_matches_report_wording() {
        let ctx = test_ctx();
        let p = ctx.heap().allocate(ctx, 10, 8);
        let mut out = String::new();
        assert!(ctx.heap().describe_addr(ctx, p as usize + 10, 1, &mut out));
        assert!(out.contains("0 bytes to the right of 10-byte region"), "{out}");
        assert!(out.contains("allocated by thread T"), "{out}");
        ctx.heap().free(ctx, p);
    }

    #[test]
    fn describe_freed_chunk_prints_both_stacks() {
        let ctx = test_ctx();
        let p = ctx.heap().allocate(ctx, 40, 8);
        ctx.heap().free(ctx, p);
        let mut out = String::new();
        assert!(ctx.heap().describe_addr(ctx, p as usize, 1, &mut out));
        assert!(out.contains("0 bytes inside of 40-byte region"), "{out}");
        assert!(out.contains("freed by thread T"), "{out}");
        assert!(out.contains("previously allocated by thread T"), "{out}");
    }

    #[test]
    fn describe_misses_unrelated_addresses() {
        let ctx = test_ctx();
        let mut out = String::new();
        assert!(!ctx.heap().describe_addr(ctx, 0x40, 1, &mut out));
    }

    #[test]
    fn allocation_bumps_statistics() {
        let ctx = test_ctx();
        let before = ctx.stats().mallocs.load(Ordering::Relaxed);
        let p = ctx.heap().allocate(ctx, 64, 8);
        assert!(ctx.stats().mallocs.load(Ordering::Relaxed) > before);
        let frees_before = ctx.stats().frees.load(Ordering::Relaxed);
        ctx.heap().free(ctx, p);
        assert!(ctx.stats().frees.load(Ordering::Relaxed) > frees_before);
    }
}
