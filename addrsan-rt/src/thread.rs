//! Per-thread bookkeeping. Every instrumented thread owns a `ThreadSummary`
//! allocated by the `pthread_create` interposer (or lazily, for threads that
//! predate init or were created behind our back); summaries are append-only
//! and retained after thread exit so post-mortem reports can still name the
//! thread that owned a stack or freed a chunk.

use addrsan_shared::{FRAME_LIVE_MAGIC, FRAME_RETIRED_MAGIC, FrameDescriptor};
use core::cell::Cell;
use core::ffi::{CStr, c_char, c_void};
use core::fmt::Write;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::mutex::SpinMutex;

use crate::global::{BVec, GlobalCtx};
use crate::hooks::{RtAlloc, ThreadRoutine};
use crate::shadow::unpoison_region;
use crate::utils::{check, page_size, round_down_to, verbose};

#[derive(Debug)]
pub struct ThreadSummary {
    tid: u32,
    parent_tid: u32,
    creation_stack: u32,
    stack_bottom: AtomicUsize,
    stack_top: AtomicUsize,
    start_routine: Option<ThreadRoutine>,
    start_arg: *mut c_void,
}

unsafe impl Send for ThreadSummary {}
unsafe impl Sync for ThreadSummary {}

impl ThreadSummary {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom.load(Ordering::Relaxed)
    }

    pub fn stack_top(&self) -> usize {
        self.stack_top.load(Ordering::Relaxed)
    }

    fn contains_stack_addr(&self, addr: usize) -> bool {
        let bottom = self.stack_bottom();
        bottom != 0 && addr >= bottom && addr < self.stack_top()
    }

    /// Makes this summary the calling thread's identity and records the
    /// thread's actual stack bounds.
    pub(crate) fn attach_to_current_thread(&'static self) {
        let (bottom, top) = os_stack_bounds();
        self.stack_bottom.store(bottom, Ordering::Relaxed);
        self.stack_top.store(top, Ordering::Relaxed);
        let local = 0u8;
        check!(self.contains_stack_addr(&local as *const u8 as usize));
        CURRENT.set(self as *const ThreadSummary);
    }

    /// Locates the instrumented frame holding `addr` by scanning stack words
    /// downward for the frame magic the compiler plants at each frame base.
    /// Returns the descriptor string and the offset of `addr` from the frame
    /// base.
    pub fn frame_descriptor_by_addr(&self, addr: usize) -> Option<(usize, *const c_char)> {
        let word = mem::size_of::<usize>();
        let bottom = self.stack_bottom();
        if !self.contains_stack_addr(addr) {
            return None;
        }
        let mut cursor = round_down_to(addr, word);
        while cursor >= bottom {
            let value = unsafe { (cursor as *const usize).read() };
            if value == FRAME_LIVE_MAGIC || value == FRAME_RETIRED_MAGIC {
                let descr = unsafe { (cursor as *const usize).add(1).read() } as *const c_char;
                return Some((addr - cursor, descr));
            }
            cursor -= word;
        }
        None
    }

    /// Writes "Thread T2 created by T1 here:" plus the creation stack.
    fn announce(&self, ctx: &GlobalCtx, out: &mut dyn Write) {
        if self.tid == 0 {
            return;
        }
        let _ = writeln!(out, "Thread T{} created by T{} here:", self.tid, self.parent_tid);
        if let Some(trace) = ctx.depot().get(self.creation_stack) {
            for (i, pc) in trace.frames().iter().enumerate() {
                let _ = writeln!(out, "    #{} {:#x}", i, pc);
            }
        }
    }
}

#[thread_local]
static CURRENT: Cell<*const ThreadSummary> = Cell::new(ptr::null());

/// Append-only registry of all summaries, keyed by tid (which is the
/// creation index).
#[derive(Debug)]
pub struct ThreadRegistry {
    threads: SpinMutex<BVec<&'static ThreadSummary>>,
    next_tid: AtomicU32,
}

impl ThreadRegistry {
    pub fn new(alloc: RtAlloc) -> ThreadRegistry {
        ThreadRegistry { threads: SpinMutex::new(BVec::new_in(alloc)), next_tid: AtomicU32::new(0) }
    }

    /// Allocates the summary for a thread about to be spawned. The summary
    /// crosses into the new thread through the trampoline argument.
    pub fn create_summary(
        &self,
        ctx: &GlobalCtx,
        parent_tid: u32,
        creation_stack: u32,
        start_routine: Option<ThreadRoutine>,
        start_arg: *mut c_void,
    ) -> &'static ThreadSummary {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let summary = alloc::boxed::Box::leak(alloc::boxed::Box::new_in(
            ThreadSummary {
                tid,
                parent_tid,
                creation_stack,
                stack_bottom: AtomicUsize::new(0),
                stack_top: AtomicUsize::new(0),
                start_routine,
                start_arg,
            },
            ctx.allocator(),
        ));
        self.threads.lock().push(summary);
        verbose!(ctx, 2, "addrsan: thread T{} registered (parent T{})", tid, parent_tid);
        summary
    }

    /// The summary whose recorded stack range contains `addr`. Try-locks so
    /// the reporter can run from a signal handler.
    pub fn find_by_stack_address(&self, addr: usize) -> Option<&'static ThreadSummary> {
        let threads = self.threads.try_lock()?;
        threads.iter().find(|t| t.contains_stack_addr(addr)).copied()
    }
}

/// The calling thread's summary, if it has one.
pub(crate) fn current_summary() -> Option<&'static ThreadSummary> {
    let ptr = CURRENT.get();
    if ptr.is_null() { None } else { Some(unsafe { &*ptr }) }
}

/// The calling thread's summary, registering the thread on first sight.
/// Threads that predate init, or that were created by uninstrumented code,
/// enter the registry here.
pub(crate) fn ensure_current_summary(ctx: &GlobalCtx) -> &'static ThreadSummary {
    if let Some(summary) = current_summary() {
        return summary;
    }
    let summary = ctx.threads().create_summary(ctx, 0, 0, None, ptr::null_mut());
    summary.attach_to_current_thread();
    summary
}

pub(crate) fn current_tid(ctx: &GlobalCtx) -> u32 {
    ensure_current_summary(ctx).tid()
}

/// Trampoline installed by the `pthread_create` interposer: adopt the
/// prepared summary, then run the user's routine.
pub(crate) extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
    let summary: &'static ThreadSummary = unsafe { &*(arg as *const ThreadSummary) };
    summary.attach_to_current_thread();
    let routine = summary.start_routine.expect("spawned thread without a start routine");
    routine(summary.start_arg)
}

/// Unwind notifier shared by `longjmp`, `siglongjmp` and the C++ throw
/// wrapper: a non-local transfer is about to discard every frame between here
/// and wherever it lands, so their poison must not outlive them. Clears
/// shadow from the current stack pointer (page-rounded down) to the stack
/// top before the real primitive runs.
pub(crate) fn unpoison_stack_from_here_to_top(ctx: &GlobalCtx) {
    let Some(summary) = current_summary() else { return };
    let local = 0u8;
    let here = &local as *const u8 as usize;
    let bottom = round_down_to(here.saturating_sub(page_size()), page_size());
    let top = summary.stack_top();
    if bottom < top {
        unpoison_region(ctx, bottom, top - bottom);
    }
}

/// Stack bounds for the calling thread straight from the OS.
fn os_stack_bounds() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return guessed_stack_bounds();
        }
        let mut addr: *mut c_void = ptr::null_mut();
        let mut size: usize = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return guessed_stack_bounds();
        }
        (addr as usize, addr as usize + size)
    }
}

/// Last-resort bounds when the OS will not say: a window around a local.
fn guessed_stack_bounds() -> (usize, usize) {
    let local = 0u8;
    let here = &local as *const u8 as usize;
    (here.saturating_sub(1 << 20), round_down_to(here, page_size()) + page_size())
}

pub(crate) fn current_stack_bounds_or_guess() -> (usize, usize) {
    match current_summary() {
        Some(summary) if summary.stack_bottom() != 0 => {
            (summary.stack_bottom(), summary.stack_top())
        }
        _ => os_stack_bounds(),
    }
}

/// Stack half of the address-description cascade: name the owning thread,
/// the enclosing instrumented frame, and every object in it.
pub(crate) fn describe_stack_address(ctx: &GlobalCtx, addr: usize, out: &mut dyn Write) -> bool {
    let Some(summary) = ctx.threads().find_by_stack_address(addr) else {
        return false;
    };
    let Some((offset, descr)) = summary.frame_descriptor_by_addr(addr) else {
        let _ = writeln!(
            out,
            "{:#x} is located in T{}'s stack (no instrumented frame found)",
            addr,
            summary.tid()
        );
        return true;
    };
    let descr_str = if descr.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(descr) }.to_str().ok()
    };
    let Some(frame) = descr_str.and_then(FrameDescriptor::parse) else {
        let _ = writeln!(
            out,
            "{:#x} is located at offset {} in an unnamed frame of T{}'s stack",
            addr,
            offset,
            summary.tid()
        );
        return true;
    };
    let _ = writeln!(
        out,
        "Address {:#x} is located at offset {} in frame <{}> of T{}'s stack:",
        addr,
        offset,
        frame.function,
        summary.tid()
    );
    let _ = writeln!(out, "  This frame has {} object(s):", frame.object_count());
    for object in frame.objects() {
        let _ = writeln!(out, "    [{}, {}) '{}'", object.offset, object.offset + object.size, object.name);
    }
    let _ = writeln!(
        out,
        "HINT: this may be a false positive if your program uses some custom stack unwind mechanism\n      (longjmp and C++ exceptions *are* supported)"
    );
    summary.announce(ctx, out);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::test_ctx;
    use alloc::string::String;

    #[test]
    fn current_thread_gets_registered_lazily() {
        let ctx = test_ctx();
        let summary = ensure_current_summary(ctx);
        assert_eq!(summary.tid(), current_tid(ctx));
        let local = 0u8;
        assert!(summary.contains_stack_addr(&local as *const u8 as usize));
        // Second call sticks to the same summary.
        assert_eq!(summary.tid(), ensure_current_summary(ctx).tid());
    }

    #[test]
    fn find_by_stack_address_locates_this_thread() {
        let ctx = test_ctx();
        let summary = ensure_current_summary(ctx);
        let local = 0u8;
        let found = ctx.threads().find_by_stack_address(&local as *const u8 as usize).unwrap();
        assert_eq!(found.tid(), summary.tid());
        assert!(ctx.threads().find_by_stack_address(0x10).is_none());
    }

    #[test]
    fn frame_scan_finds_planted_magic() {
        let ctx = test_ctx();
        let summary = ensure_current_summary(ctx);
        // Lay out what an instrumented prologue leaves on the stack: the
        // magic, the descriptor pointer, then the frame's locals above them.
        let descr = c"two_buffers 2 16 8 1 a 32 8 1 b ";
        let frame: [usize; 8] = [
            FRAME_LIVE_MAGIC,
            descr.as_ptr() as usize,
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        let probe = &frame[5] as *const usize as usize;
        let (offset, found) = summary.frame_descriptor_by_addr(probe).unwrap();
        assert_eq!(offset, 5 * mem::size_of::<usize>());
        assert_eq!(found, descr.as_ptr());
    }

    #[test]
    fn stack_description_lists_frame_objects() {
        let ctx = test_ctx();
        ensure_current_summary(ctx);
        let descr = c"two_buffers 2 16 8 1 a 32 8 1 b ";
        let frame: [usize; 6] = [FRAME_LIVE_MAGIC, descr.as_ptr() as usize, 0, 0, 0, 0];
        let probe = &frame[4] as *const usize as usize;

        let mut out = String::new();
        assert!(describe_stack_address(ctx, probe, &mut out));
        assert!(out.contains("in frame <two_buffers>"), "{out}");
        assert!(out.contains("This frame has 2 object(s):"), "{out}");
        assert!(out.contains("[16, 24) 'a'"), "{out}");
        assert!(out.contains("[32, 40) 'b'"), "{out}");
    }

    #[test]
    fn unpoison_to_top_clears_planted_poison() {
        use addrsan_shared::mapping::SHADOW_GRANULARITY;
        use addrsan_shared::poison::STACK_MID_RZ;
        let ctx = test_ctx();
        ensure_current_summary(ctx);
        // Poison a granule-aligned window of this very stack, then ask the
        // unwind notifier to clean everything above the current SP.
        let buffer = [0u8; 64];
        let beg = crate::utils::round_up_to(buffer.as_ptr() as usize, SHADOW_GRANULARITY);
        crate::shadow::poison_region(ctx, beg, 32, STACK_MID_RZ);
        assert_eq!(crate::shadow::shadow_byte(beg), STACK_MID_RZ);
        unpoison_stack_from_here_to_top(ctx);
        assert_eq!(crate::shadow::shadow_byte(beg), 0);
    }
}
