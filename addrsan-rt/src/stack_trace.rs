//! Bounded stack-trace capture and the depot that stores one copy of every
//! distinct trace. Allocation and free sites reference depot entries by id
//! from their chunk headers.
//!
//! The fast unwinder walks the frame-pointer chain and trusts nothing: every
//! step is bounds- and alignment-checked against the thread's stack, so a
//! broken chain just ends the trace. The slow unwinder delegates to the
//! platform unwinder when available.

use core::ffi::c_void;
use core::hash::Hasher;

use libc_print::std_name::eprintln;
use rustc_hash::FxHasher;
use spin::mutex::SpinMutex;

use crate::global::{BHashMap, BVec};
use crate::hooks::RtAlloc;

pub const MAX_STACK_DEPTH: usize = 64;

/// A pc sequence, innermost frame first.
#[derive(Clone, Copy, Debug)]
pub struct StackTrace {
    pcs: [usize; MAX_STACK_DEPTH],
    len: usize,
}

impl StackTrace {
    pub const fn empty() -> StackTrace {
        StackTrace { pcs: [0; MAX_STACK_DEPTH], len: 0 }
    }

    pub fn frames(&self) -> &[usize] {
        &self.pcs[..self.len]
    }

    pub fn push(&mut self, pc: usize) {
        if self.len < MAX_STACK_DEPTH {
            self.pcs[self.len] = pc;
            self.len += 1;
        }
    }

    /// Frame-pointer walk from `bp`, recording `pc` as the innermost frame.
    /// Each saved frame pointer must land strictly above the previous one and
    /// inside `[bottom, top)`, word-aligned; the first violation ends the
    /// walk.
    pub fn capture_fast(
        pc: usize,
        bp: usize,
        bottom: usize,
        top: usize,
        max_depth: usize,
    ) -> StackTrace {
        let mut trace = StackTrace::empty();
        let max_depth = max_depth.min(MAX_STACK_DEPTH);
        if pc != 0 {
            trace.push(pc);
        }
        let word = core::mem::size_of::<usize>();
        let mut frame = bp;
        while trace.len < max_depth {
            if frame % word != 0 || frame < bottom || frame.saturating_add(2 * word) > top {
                break;
            }
            let (next, ret) = unsafe {
                let p = frame as *const usize;
                (p.read(), p.add(1).read())
            };
            if ret == 0 {
                break;
            }
            trace.push(ret);
            if next <= frame {
                break;
            }
            frame = next;
        }
        trace
    }

    /// Full unwind through the platform unwinder. Only available on glibc;
    /// elsewhere it returns an empty trace and callers fall back to the fast
    /// walk.
    pub fn capture_slow(max_depth: usize) -> StackTrace {
        let mut trace = StackTrace::empty();
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            let mut buffer = [core::ptr::null_mut::<c_void>(); MAX_STACK_DEPTH];
            let depth = max_depth.min(MAX_STACK_DEPTH) as i32;
            let n = unsafe { backtrace(buffer.as_mut_ptr(), depth) };
            for pc in &buffer[..n.max(0) as usize] {
                trace.push(*pc as usize);
            }
        }
        #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
        {
            let _ = max_depth;
        }
        trace
    }

    pub fn print(&self) {
        for (i, pc) in self.frames().iter().enumerate() {
            eprintln!("    #{} {:#x}", i, pc);
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: i32) -> i32;
}

/// Reads the current frame pointer. Meaningful only while frame pointers are
/// maintained; the fast unwinder tolerates garbage.
#[inline(always)]
pub(crate) fn current_frame_pointer() -> usize {
    let bp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) bp, options(nomem, nostack));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) bp, options(nomem, nostack));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        bp = 0;
    }
    bp
}

/// Captures the caller's stack with the configured unwinder, using the
/// current thread's registered stack bounds.
pub(crate) fn capture_here(ctx: &crate::global::GlobalCtx, max_depth: usize) -> StackTrace {
    if !ctx.flags().fast_unwind {
        let slow = StackTrace::capture_slow(max_depth);
        if !slow.frames().is_empty() {
            return slow;
        }
    }
    let (bottom, top) = crate::thread::current_stack_bounds_or_guess();
    StackTrace::capture_fast(0, current_frame_pointer(), bottom, top, max_depth)
}

/// Append-only store of deduplicated stack traces. Id 0 is the empty trace.
#[derive(Debug)]
pub struct StackDepot {
    inner: SpinMutex<DepotInner>,
}

#[derive(Debug)]
struct DepotInner {
    pcs: BVec<usize>,
    traces: BVec<(u32, u32)>,
    index: BHashMap<u64, u32>,
}

impl StackDepot {
    pub fn new(alloc: RtAlloc) -> StackDepot {
        let mut traces = BVec::new_in(alloc);
        traces.push((0, 0));
        StackDepot {
            inner: SpinMutex::new(DepotInner {
                pcs: BVec::new_in(alloc),
                traces,
                index: BHashMap::new_in(alloc),
            }),
        }
    }

    pub fn store(&self, trace: &StackTrace) -> u32 {
        let frames = trace.frames();
        if frames.is_empty() {
            return 0;
        }
        let mut hasher = FxHasher::default();
        for pc in frames {
            hasher.write_usize(*pc);
        }
        let hash = hasher.finish();

        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.get(&hash) {
            return *id;
        }
        let start = inner.pcs.len() as u32;
        inner.pcs.extend_from_slice(frames);
        let id = inner.traces.len() as u32;
        inner.traces.push((start, frames.len() as u32));
        inner.index.insert(hash, id);
        id
    }

    /// Copies a stored trace back out; `None` for unknown ids so a corrupted
    /// header cannot crash the reporter.
    pub fn get(&self, id: u32) -> Option<StackTrace> {
        if id == 0 {
            return Some(StackTrace::empty());
        }
        let inner = self.inner.try_lock()?;
        let (start, len) = *inner.traces.get(id as usize)?;
        let mut trace = StackTrace::empty();
        for pc in &inner.pcs[start as usize..(start + len) as usize] {
            trace.push(*pc);
        }
        Some(trace)
    }

    pub fn print(&self, id: u32) {
        match self.get(id) {
            Some(trace) if !trace.frames().is_empty() => trace.print(),
            Some(_) => eprintln!("    <empty stack>"),
            None => eprintln!("    <stack unavailable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::test_ctx;

    fn synthetic(frames: &[usize]) -> StackTrace {
        let mut trace = StackTrace::empty();
        for pc in frames {
            trace.push(*pc);
        }
        trace
    }

    #[test]
    fn depot_deduplicates() {
        let ctx = test_ctx();
        let depot = StackDepot::new(ctx.allocator());
        let a = depot.store(&synthetic(&[1, 2, 3]));
        let b = depot.store(&synthetic(&[1, 2, 3]));
        let c = depot.store(&synthetic(&[4, 5]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(depot.get(a).unwrap().frames(), &[1, 2, 3]);
        assert_eq!(depot.get(c).unwrap().frames(), &[4, 5]);
    }

    #[test]
    fn empty_trace_is_id_zero() {
        let ctx = test_ctx();
        let depot = StackDepot::new(ctx.allocator());
        assert_eq!(depot.store(&StackTrace::empty()), 0);
        assert_eq!(depot.get(0).unwrap().frames(), &[] as &[usize]);
    }

    #[test]
    fn fast_walk_respects_bounds() {
        // A synthetic two-frame stack laid out in a local buffer.
        let mut fake = [0usize; 8];
        let base = fake.as_mut_ptr() as usize;
        fake[0] = base + 4 * core::mem::size_of::<usize>(); // saved bp
        fake[1] = 0x1111; // return address
        fake[4] = base + 64 * core::mem::size_of::<usize>(); // out of bounds
        fake[5] = 0x2222;
        let top = base + core::mem::size_of_val(&fake);
        let trace = StackTrace::capture_fast(0xaaaa, base, base, top, 16);
        assert_eq!(trace.frames(), &[0xaaaa, 0x1111, 0x2222]);
    }

    #[test]
    fn capture_here_returns_at_least_something() {
        let ctx = test_ctx();
        let trace = capture_here(ctx, 16);
        // With or without frame pointers the walk must terminate cleanly.
        assert!(trace.frames().len() <= MAX_STACK_DEPTH);
    }
}
