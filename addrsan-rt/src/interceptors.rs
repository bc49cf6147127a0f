//! The interposed symbol surface. On this platform interposition is plain
//! symbol shadowing: the runtime exports the libc names (and the
//! Itanium-mangled operator new/delete names) and reaches the real versions
//! through `dlsym(RTLD_NEXT)`.
//!
//! Every entry funnels through the init state machine: before the runtime is
//! up, allocation is served by the bootstrap pool and everything else
//! triggers init first.

use core::ffi::{c_int, c_void};

use crate::global::{self, GlobalCtx};
use crate::hooks::ThreadRoutine;
use crate::stack_trace;
use crate::thread;
use crate::utils::{page_size, round_up_to};

fn ctx_for_entry() -> &'static GlobalCtx {
    global::ensure_ctx()
}

// ---- malloc family -------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    global::malloc_entry(size, 0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    global::calloc_entry(nmemb, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let ctx = ctx_for_entry();
    if crate::hooks::is_bootstrap_ptr(ptr) {
        // Bootstrap allocations carry no header; treat like a fresh alloc.
        return global::malloc_entry(size, 0);
    }
    ctx.heap().realloc(ctx, ptr.cast::<u8>(), size).cast::<c_void>()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    global::free_entry(ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(boundary: usize, size: usize) -> *mut c_void {
    global::malloc_entry(size, boundary)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % core::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    let ptr = global::malloc_entry(size, alignment);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    unsafe { memptr.write(ptr) };
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    global::malloc_entry(size, page_size())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let pg = page_size();
    global::malloc_entry(round_up_to(size.max(1), pg), pg)
}

// ---- operator new / delete ----------------------------------------------
//
// Exported under their Itanium-ABI names so C++ translation units resolve to
// the sanitized allocator without recompilation. The throwing variants
// return null on exhaustion like the originals did; propagating bad_alloc
// from here is not possible.

#[unsafe(export_name = "_Znwm")]
pub unsafe extern "C" fn operator_new(size: usize) -> *mut c_void {
    global::malloc_entry(size, 0)
}

#[unsafe(export_name = "_Znam")]
pub unsafe extern "C" fn operator_new_array(size: usize) -> *mut c_void {
    global::malloc_entry(size, 0)
}

#[unsafe(export_name = "_ZnwmRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_new_nothrow(size: usize, _tag: *const c_void) -> *mut c_void {
    global::malloc_entry(size, 0)
}

#[unsafe(export_name = "_ZnamRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_new_array_nothrow(
    size: usize,
    _tag: *const c_void,
) -> *mut c_void {
    global::malloc_entry(size, 0)
}

#[unsafe(export_name = "_ZdlPv")]
pub unsafe extern "C" fn operator_delete(ptr: *mut c_void) {
    global::free_entry(ptr)
}

#[unsafe(export_name = "_ZdaPv")]
pub unsafe extern "C" fn operator_delete_array(ptr: *mut c_void) {
    global::free_entry(ptr)
}

#[unsafe(export_name = "_ZdlPvRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_delete_nothrow(ptr: *mut c_void, _tag: *const c_void) {
    global::free_entry(ptr)
}

#[unsafe(export_name = "_ZdaPvRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_delete_array_nothrow(ptr: *mut c_void, _tag: *const c_void) {
    global::free_entry(ptr)
}

// ---- signals -------------------------------------------------------------
//
// SIGSEGV and SIGILL belong to the runtime. Callers installing handlers for
// them get success and no effect; everything else passes through.

#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal(signum: c_int, handler: libc::sighandler_t) -> libc::sighandler_t {
    let ctx = ctx_for_entry();
    if crate::signals::is_owned_signal(signum) {
        return 0;
    }
    unsafe { (ctx.hooks().signal)(signum, handler) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    let ctx = ctx_for_entry();
    if crate::signals::is_owned_signal(signum) {
        return 0;
    }
    unsafe { (ctx.hooks().sigaction)(signum, act, oldact) }
}

// ---- non-local exits -----------------------------------------------------
//
// A non-local transfer abandons every frame between the jump and its target;
// their redzones must be cleared before the real primitive discards them, or
// reused stack bytes would be flagged forever after.

#[unsafe(no_mangle)]
pub unsafe extern "C" fn longjmp(env: *mut c_void, val: c_int) {
    let ctx = ctx_for_entry();
    thread::unpoison_stack_from_here_to_top(ctx);
    unsafe { (ctx.hooks().longjmp)(env, val) };
    unreachable!("longjmp returned");
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn siglongjmp(env: *mut c_void, val: c_int) {
    let ctx = ctx_for_entry();
    thread::unpoison_stack_from_here_to_top(ctx);
    unsafe { (ctx.hooks().siglongjmp)(env, val) };
    unreachable!("siglongjmp returned");
}

#[unsafe(export_name = "__cxa_throw")]
pub unsafe extern "C" fn cxa_throw(exception: *mut c_void, tinfo: *mut c_void, dest: *mut c_void) {
    let ctx = ctx_for_entry();
    thread::unpoison_stack_from_here_to_top(ctx);
    match ctx.hooks().cxa_throw {
        Some(real) => unsafe { real(exception, tinfo, dest) },
        // A throw without a loaded C++ runtime cannot happen through normal
        // linkage.
        None => crate::utils::check_failed("__cxa_throw resolved", file!(), line!()),
    }
    unreachable!("__cxa_throw returned");
}

// ---- pthread_create ------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_create(
    thread_out: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: ThreadRoutine,
    arg: *mut c_void,
) -> c_int {
    let ctx = ctx_for_entry();
    let trace = stack_trace::capture_here(ctx, stack_trace::MAX_STACK_DEPTH);
    let creation_stack = ctx.depot().store(&trace);
    let parent = thread::current_tid(ctx);
    let summary = ctx.threads().create_summary(ctx, parent, creation_stack, Some(start_routine), arg);
    unsafe {
        (ctx.hooks().pthread_create)(
            thread_out,
            attr,
            thread::thread_start,
            summary as *const thread::ThreadSummary as *mut c_void,
        )
    }
}
