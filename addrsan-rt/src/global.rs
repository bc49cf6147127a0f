//! The process-wide singleton. Flags, real-symbol hooks, the allocator, the
//! registries, the stack depot and the statistics are inherently global;
//! everything else in the runtime threads through explicit arguments. Only
//! shared references to `GlobalCtx` ever exist once init publishes it.

use core::cell::SyncUnsafeCell;
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

use addrsan_shared::mapping::{
    HIGH_MEM_BEG, HIGH_MEM_END, HIGH_SHADOW_BEG, HIGH_SHADOW_END, LOW_MEM_BEG, LOW_MEM_END,
    LOW_SHADOW_BEG, LOW_SHADOW_END, SHADOW_GAP_BEG, SHADOW_GAP_END, SHADOW_OFFSET, SHADOW_SCALE,
    mem_to_shadow,
};
use alloc::vec::Vec;
use hashbrown::HashMap;
use libc_print::std_name::eprintln;
use rustc_hash::FxBuildHasher;

use crate::flags::Flags;
use crate::globals::GlobalRegistry;
use crate::heap::HeapAllocator;
use crate::hooks::{RealHooks, RtAlloc, bootstrap_alloc, is_bootstrap_ptr};
use crate::stack_trace::StackDepot;
use crate::stats::AsanStats;
use crate::thread::ThreadRegistry;
use crate::utils::{check, getpid, verbose};

#[derive(Debug)]
pub struct GlobalCtx {
    flags: Flags,
    hooks: RealHooks,
    heap: HeapAllocator,
    globals: GlobalRegistry,
    threads: ThreadRegistry,
    depot: StackDepot,
    stats: AsanStats,
}

impl GlobalCtx {
    fn new(flags: Flags, hooks: RealHooks) -> GlobalCtx {
        GlobalCtx {
            flags,
            hooks,
            heap: HeapAllocator::new(hooks.alloc),
            globals: GlobalRegistry::new(hooks.alloc),
            threads: ThreadRegistry::new(hooks.alloc),
            depot: StackDepot::new(hooks.alloc),
            stats: AsanStats::new(),
        }
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn hooks(&self) -> &RealHooks {
        &self.hooks
    }

    pub fn allocator(&self) -> RtAlloc {
        self.hooks.alloc
    }

    pub fn heap(&self) -> &HeapAllocator {
        &self.heap
    }

    pub fn globals(&self) -> &GlobalRegistry {
        &self.globals
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn depot(&self) -> &StackDepot {
        &self.depot
    }

    pub fn stats(&self) -> &AsanStats {
        &self.stats
    }

    /// Statistics in reports are opt-in via the `stats` flag.
    pub fn print_stats(&self) {
        if self.flags.stats {
            self.stats.print();
        }
    }
}

const UNINIT: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

static GLOBAL_CTX: SyncUnsafeCell<MaybeUninit<GlobalCtx>> =
    SyncUnsafeCell::new(MaybeUninit::uninit());

/// Brings the runtime up. Idempotent and callable from any interposed entry;
/// run automatically from the loader constructor. The runtime counts as
/// initialized only once the real symbols are resolved, the signal handlers
/// are in place, the shadow is reserved and the main thread has a summary.
pub fn init() {
    match INIT_STATE.compare_exchange(UNINIT, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(DONE) => return,
        Err(_) => {
            // Another thread is mid-init. Allocation entries never land here
            // (they check the state themselves), so waiting cannot deadlock.
            while INIT_STATE.load(Ordering::Acquire) != DONE {
                core::hint::spin_loop();
            }
            return;
        }
    }

    let flags = Flags::from_env();
    let hooks = match RealHooks::resolve() {
        Ok(hooks) => hooks,
        Err(err) => {
            eprintln!("=={}== AddressSanitizer failed to initialize: {}", getpid(), err);
            unsafe { libc::abort() }
        }
    };

    unsafe {
        (*GLOBAL_CTX.get()).write(GlobalCtx::new(flags, hooks));
    }
    let ctx = unsafe { global_ctx() };

    crate::signals::install(ctx);
    crate::shadow::map_shadow_regions(ctx);
    print_banner(ctx);

    INIT_STATE.store(DONE, Ordering::Release);

    // The main thread summary allocates, so it comes after the flip.
    let main = ctx.threads().create_summary(ctx, 0, 0, None, core::ptr::null_mut());
    main.attach_to_current_thread();

    if ctx.flags().atexit {
        unsafe { libc::atexit(stats_at_exit) };
    }
    verbose!(ctx, 1, "=={}== AddressSanitizer Init done", getpid());
}

fn print_banner(ctx: &GlobalCtx) {
    check!(SHADOW_SCALE >= 3 && SHADOW_SCALE <= 7);
    if ctx.flags().verbosity < 1 {
        return;
    }
    eprintln!("|| `[{:#x}, {:#x}]` || HighMem    ||", HIGH_MEM_BEG, HIGH_MEM_END);
    eprintln!("|| `[{:#x}, {:#x}]` || HighShadow ||", HIGH_SHADOW_BEG, HIGH_SHADOW_END);
    eprintln!("|| `[{:#x}, {:#x}]` || ShadowGap  ||", SHADOW_GAP_BEG, SHADOW_GAP_END);
    eprintln!("|| `[{:#x}, {:#x}]` || LowShadow  ||", LOW_SHADOW_BEG, LOW_SHADOW_END);
    eprintln!("|| `[{:#x}, {:#x}]` || LowMem     ||", LOW_MEM_BEG, LOW_MEM_END);
    eprintln!(
        "shadow(shadow): {:#x} {:#x} {:#x} {:#x}",
        mem_to_shadow(LOW_SHADOW_BEG),
        mem_to_shadow(LOW_SHADOW_END),
        mem_to_shadow(HIGH_SHADOW_BEG),
        mem_to_shadow(HIGH_SHADOW_END)
    );
    eprintln!("SHADOW_SCALE: {}", SHADOW_SCALE);
    eprintln!("SHADOW_OFFSET: {:#x}", SHADOW_OFFSET);
    eprintln!("redzone={}", ctx.flags().redzone);
    eprintln!("malloc_context_size={}", ctx.flags().malloc_context_size);
    eprintln!("fast_unwind={}", ctx.flags().fast_unwind as u8);
}

extern "C" fn stats_at_exit() {
    eprintln!("AddressSanitizer exit stats:");
    let ctx = unsafe { global_ctx() };
    ctx.stats().print();
}

/// # Safety
/// The caller must know init has completed; interposers go through
/// [`ensure_ctx`] instead.
pub unsafe fn global_ctx() -> &'static GlobalCtx {
    unsafe { (*GLOBAL_CTX.get()).assume_init_ref() }
}

/// The context, initializing the runtime first if this is the first entry.
pub(crate) fn ensure_ctx() -> &'static GlobalCtx {
    if INIT_STATE.load(Ordering::Acquire) != DONE {
        init();
    }
    unsafe { global_ctx() }
}

// ---- interposer entry helpers -------------------------------------------
//
// The allocation entries own the bootstrap dance: before init completes the
// dynamic linker's requests come out of the fixed pool, and pool pointers
// are never freed.

pub(crate) fn malloc_entry(size: usize, alignment: usize) -> *mut c_void {
    match INIT_STATE.load(Ordering::Acquire) {
        DONE => {}
        IN_PROGRESS => return bootstrap_alloc(size),
        _ => init(),
    }
    let ctx = unsafe { global_ctx() };
    ctx.heap().allocate(ctx, size, alignment).cast::<c_void>()
}

pub(crate) fn calloc_entry(nmemb: usize, size: usize) -> *mut c_void {
    match INIT_STATE.load(Ordering::Acquire) {
        DONE => {}
        // The pool is zero-initialized and never reused, which is exactly
        // calloc's contract.
        IN_PROGRESS => return bootstrap_alloc(nmemb.saturating_mul(size)),
        _ => init(),
    }
    let ctx = unsafe { global_ctx() };
    ctx.heap().calloc(ctx, nmemb, size).cast::<c_void>()
}

pub(crate) fn free_entry(ptr: *mut c_void) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    if INIT_STATE.load(Ordering::Acquire) != DONE {
        // Freeing before init can only name a foreign pointer; leak it.
        return;
    }
    let ctx = unsafe { global_ctx() };
    ctx.heap().free(ctx, ptr.cast::<u8>());
}

// ---- allocator-backed collections ----------------------------------------

/// A `Vec` pinned to the runtime's internal allocator.
#[derive(Debug, Clone)]
pub struct BVec<T>(Vec<T, RtAlloc>);

impl<T> BVec<T> {
    pub fn new_in(alloc: RtAlloc) -> BVec<T> {
        BVec(Vec::new_in(alloc))
    }
}

impl<T> Deref for BVec<T> {
    type Target = Vec<T, RtAlloc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for BVec<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Reports are formatted into one of these before a single write to stderr.
impl core::fmt::Write for BVec<u8> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.0.try_reserve(s.len()).is_err() {
            return Err(core::fmt::Error);
        }
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// A `HashMap` pinned to the runtime's internal allocator.
#[derive(Debug, Clone)]
pub struct BHashMap<K, V>(HashMap<K, V, FxBuildHasher, RtAlloc>);

impl<K, V> BHashMap<K, V> {
    pub fn new_in(alloc: RtAlloc) -> BHashMap<K, V> {
        BHashMap(HashMap::with_hasher_in(FxBuildHasher, alloc))
    }
}

impl<K, V> Deref for BHashMap<K, V> {
    type Target = HashMap<K, V, FxBuildHasher, RtAlloc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for BHashMap<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
pub(crate) fn test_ctx() -> &'static GlobalCtx {
    init();
    unsafe { global_ctx() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        let ctx = test_ctx();
        assert_eq!(ctx.flags().redzone, 128);
    }

    #[test]
    fn entries_route_after_init() {
        let ptr = malloc_entry(24, 0);
        assert!(!ptr.is_null());
        free_entry(ptr);
        let zeroed = calloc_entry(4, 4);
        unsafe {
            for i in 0..16 {
                assert_eq!(zeroed.cast::<u8>().add(i).read(), 0);
            }
        }
        free_entry(zeroed);
        free_entry(core::ptr::null_mut());
    }

    #[test]
    fn bvec_collects_formatted_text() {
        use core::fmt::Write;
        let ctx = test_ctx();
        let mut out = BVec::new_in(ctx.allocator());
        write!(out, "T{} {:#x}", 7, 0x10usize).unwrap();
        assert_eq!(core::str::from_utf8(&out).unwrap(), "T7 0x10");
    }
}
