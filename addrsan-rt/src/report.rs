//! Turning a trapped access into a diagnosis. Every entry point here is
//! terminal: the report goes to stderr and the process aborts.
//!
//! The pipeline is fixed: classify the shadow byte under the faulting
//! address, print the bug header and the access stack, describe the address
//! against the global / stack / heap registries in that order, dump
//! statistics and a window of shadow memory, abort. The description steps
//! write into a buffer first so the same code can be exercised without
//! aborting.

use addrsan_shared::AccessInfo;
use addrsan_shared::mapping::{addr_is_in_mem, mem_to_shadow};
use addrsan_shared::poison::{
    GLOBAL_RZ, HEAP_FREED, HEAP_LEFT_RZ, HEAP_RIGHT_RZ, STACK_AFTER_RETURN, STACK_LEFT_RZ,
    STACK_MID_RZ, STACK_PARTIAL_RZ, STACK_RIGHT_RZ, is_partial,
};
use core::fmt::Write;

use libc_print::std_name::{eprint, eprintln};

use crate::global::{BVec, GlobalCtx};
use crate::stack_trace::{self, StackTrace};
use crate::utils::{check, getpid};

/// What a poisoned shadow byte means went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BugKind {
    HeapBufferOverflow,
    HeapUseAfterFree,
    StackBufferUnderflow,
    StackBufferOverflow,
    StackUseAfterReturn,
    GlobalBufferOverflow,
    UnknownCrash,
}

impl BugKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            BugKind::HeapBufferOverflow => "heap-buffer-overflow",
            BugKind::HeapUseAfterFree => "heap-use-after-free",
            BugKind::StackBufferUnderflow => "stack-buffer-underflow",
            BugKind::StackBufferOverflow => "stack-buffer-overflow",
            BugKind::StackUseAfterReturn => "stack-use-after-return",
            BugKind::GlobalBufferOverflow => "global-buffer-overflow",
            BugKind::UnknownCrash => "unknown-crash",
        }
    }

    /// Maps a shadow byte to a bug. A partial-addressability byte means the
    /// access ran off the end of a granule, and the byte after it carries the
    /// actual redzone magic.
    pub(crate) fn classify(shadow_byte: u8, next_shadow_byte: u8) -> BugKind {
        let byte = if is_partial(shadow_byte) { next_shadow_byte } else { shadow_byte };
        match byte {
            HEAP_LEFT_RZ | HEAP_RIGHT_RZ => BugKind::HeapBufferOverflow,
            HEAP_FREED => BugKind::HeapUseAfterFree,
            STACK_LEFT_RZ => BugKind::StackBufferUnderflow,
            STACK_MID_RZ | STACK_RIGHT_RZ | STACK_PARTIAL_RZ => BugKind::StackBufferOverflow,
            STACK_AFTER_RETURN => BugKind::StackUseAfterReturn,
            GLOBAL_RZ => BugKind::GlobalBufferOverflow,
            _ => BugKind::UnknownCrash,
        }
    }

    fn for_addr(addr: usize) -> BugKind {
        if !addr_is_in_mem(addr) {
            return BugKind::UnknownCrash;
        }
        let shadow = mem_to_shadow(addr) as *const u8;
        unsafe { BugKind::classify(shadow.read(), shadow.add(1).read()) }
    }
}

/// Full report for a failed shadow check, from either the SIGILL decoder or
/// a `__addrsan_report_error_*` call.
pub(crate) fn report_access_error(
    ctx: &GlobalCtx,
    pc: usize,
    bp: usize,
    sp: usize,
    addr: usize,
    access: AccessInfo,
) -> ! {
    eprintln!("=================================================================");
    print_unwinder_hint(ctx);

    let mut out = BVec::new_in(ctx.allocator());
    write_access_report(ctx, pc, bp, sp, addr, access, &mut out);
    eprint!("{}", core::str::from_utf8(&out).unwrap_or("<report encoding error>"));

    if ctx.flags().debug {
        print_word_bytes("PC: ", pc & !(core::mem::size_of::<usize>() - 1));
    }
    check!(addr_is_in_mem(addr));

    eprintln!("=={}== ABORTING", getpid());
    ctx.print_stats();
    dump_shadow_around(addr);
    unsafe { libc::abort() }
}

/// The printable body of an access report: header, access line, stack,
/// address description. Separated from the terminal wrapper so it can be
/// asserted on.
pub(crate) fn write_access_report(
    ctx: &GlobalCtx,
    pc: usize,
    bp: usize,
    sp: usize,
    addr: usize,
    access: AccessInfo,
    out: &mut dyn Write,
) {
    let bug = BugKind::for_addr(addr);
    let _ = writeln!(
        out,
        "=={}== ERROR: AddressSanitizer {} on address {:#x} at pc {:#x} bp {:#x} sp {:#x}",
        getpid(),
        bug.name(),
        addr,
        pc,
        bp,
        sp
    );
    let _ = writeln!(
        out,
        "{} of size {} at {:#x} thread T{}",
        if access.is_write { "WRITE" } else { "READ" },
        access.size,
        addr,
        crate::thread::current_tid(ctx)
    );

    let (bottom, top) = crate::thread::current_stack_bounds_or_guess();
    let trace = if ctx.flags().fast_unwind {
        StackTrace::capture_fast(pc, bp, bottom, top, stack_trace::MAX_STACK_DEPTH)
    } else {
        StackTrace::capture_slow(stack_trace::MAX_STACK_DEPTH)
    };
    for (i, frame_pc) in trace.frames().iter().enumerate() {
        let _ = writeln!(out, "    #{} {:#x}", i, frame_pc);
    }

    describe_address(ctx, addr, access.size, out);
}

/// The address-description cascade: globals, then stacks, then the heap,
/// then an honest shrug.
pub(crate) fn describe_address(
    ctx: &GlobalCtx,
    addr: usize,
    access_size: usize,
    out: &mut dyn Write,
) {
    if ctx.globals().describe_addr(ctx, addr, out) {
        return;
    }
    if crate::thread::describe_stack_address(ctx, addr, out) {
        return;
    }
    if ctx.heap().describe_addr(ctx, addr, access_size, out) {
        return;
    }
    let _ = writeln!(out, "Address {:#x} is not tracked by any registry", addr);
}

/// Terminal report for a bad `free`/`realloc` argument. `action` names the
/// offending operation.
pub(crate) fn report_free_error(ctx: &GlobalCtx, action: &str, addr: usize) -> ! {
    eprintln!("=================================================================");
    print_unwinder_hint(ctx);
    eprintln!(
        "=={}== ERROR: AddressSanitizer {} on {:#x} in thread T{}:",
        getpid(),
        action,
        addr,
        crate::thread::current_tid(ctx)
    );
    stack_trace::capture_here(ctx, stack_trace::MAX_STACK_DEPTH).print();

    let mut out = BVec::new_in(ctx.allocator());
    describe_address(ctx, addr, 1, &mut out);
    eprint!("{}", core::str::from_utf8(&out).unwrap_or("<report encoding error>"));

    eprintln!("=={}== ABORTING", getpid());
    ctx.print_stats();
    unsafe { libc::abort() }
}

/// Minimal report for a fault the shadow cannot explain: a wild pointer, a
/// gap access, or a crash in uninstrumented code.
pub(crate) fn report_unknown_crash(
    ctx: &GlobalCtx,
    pc: usize,
    sp: usize,
    bp: usize,
    ax: usize,
    addr: usize,
) -> ! {
    eprintln!(
        "=={}== ERROR: AddressSanitizer crashed on unknown address {:#x} (pc {:#x} sp {:#x} bp {:#x} ax {:#x} T{})",
        getpid(),
        addr,
        pc,
        sp,
        bp,
        ax,
        crate::thread::current_tid(ctx)
    );
    eprintln!("AddressSanitizer can not provide additional info. ABORTING");
    // Fast walk first; the full unwinder may not be signal-safe but we are
    // aborting anyway.
    let (bottom, top) = crate::thread::current_stack_bounds_or_guess();
    StackTrace::capture_fast(pc, bp, bottom, top, stack_trace::MAX_STACK_DEPTH).print();
    eprintln!();
    StackTrace::capture_slow(stack_trace::MAX_STACK_DEPTH).print();
    ctx.print_stats();
    unsafe { libc::abort() }
}

/// Entry for the exported `__addrsan_report_error_<code>` family: reconstruct
/// pc/bp/sp from the call site as well as we can, then report.
pub(crate) fn report_from_call(code: u8, addr: usize) -> ! {
    let ctx = crate::global::ensure_ctx();
    let access = AccessInfo::from_code(code).unwrap_or(AccessInfo { size: 1, is_write: false });
    let bp = stack_trace::current_frame_pointer();
    let local = 0usize;
    let sp = &local as *const usize as usize;
    let (bottom, top) = crate::thread::current_stack_bounds_or_guess();
    // The return address slot is only trustworthy while frame pointers are
    // kept; bounds-check before trusting it.
    let word = core::mem::size_of::<usize>();
    let pc = if bp >= bottom && bp + 2 * word <= top {
        unsafe { (bp as *const usize).add(1).read() }
    } else {
        0
    };
    report_access_error(ctx, pc, bp, sp, addr, access)
}

fn print_unwinder_hint(ctx: &GlobalCtx) {
    if ctx.flags().fast_unwind {
        eprintln!(
            "HINT: if your stack trace looks short or garbled, use ASAN_OPTIONS=fast_unwind=0"
        );
    }
}

/// One line of raw bytes at `addr`, word-sized.
fn print_word_bytes(prefix: &str, addr: usize) {
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, 8) };
    eprintln!(
        "{}{:#018x}: {:02x} {:02x} {:02x} {:02x} {:02x} {:02x} {:02x} {:02x}",
        prefix,
        addr,
        bytes[0],
        bytes[1],
        bytes[2],
        bytes[3],
        bytes[4],
        bytes[5],
        bytes[6],
        bytes[7]
    );
}

/// Nine shadow words centered on the faulting address's shadow byte.
fn dump_shadow_around(addr: usize) {
    let shadow_addr = mem_to_shadow(addr);
    eprintln!("Shadow byte and word:");
    eprintln!("  {:#018x}: {:x}", shadow_addr, unsafe { (shadow_addr as *const u8).read() });
    let word = core::mem::size_of::<usize>();
    let aligned = shadow_addr & !(word - 1);
    print_word_bytes("  ", aligned);
    eprintln!("More shadow bytes:");
    for delta in -4i32..=4 {
        let line = aligned.wrapping_add_signed(delta as isize * word as isize);
        print_word_bytes(if delta == 0 { "=>" } else { "  " }, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::test_ctx;
    use addrsan_shared::mapping::SHADOW_SCALE;
    use alloc::string::String;

    #[test]
    fn shadow_bytes_classify_to_bug_names() {
        let cases = [
            (HEAP_LEFT_RZ, BugKind::HeapBufferOverflow),
            (HEAP_RIGHT_RZ, BugKind::HeapBufferOverflow),
            (HEAP_FREED, BugKind::HeapUseAfterFree),
            (STACK_LEFT_RZ, BugKind::StackBufferUnderflow),
            (STACK_MID_RZ, BugKind::StackBufferOverflow),
            (STACK_RIGHT_RZ, BugKind::StackBufferOverflow),
            (STACK_PARTIAL_RZ, BugKind::StackBufferOverflow),
            (STACK_AFTER_RETURN, BugKind::StackUseAfterReturn),
            (GLOBAL_RZ, BugKind::GlobalBufferOverflow),
            (0x42, BugKind::UnknownCrash),
        ];
        for (byte, expected) in cases {
            assert_eq!(BugKind::classify(byte, 0), expected, "{byte:#x}");
        }
    }

    #[test]
    fn partial_byte_defers_to_the_next_granule() {
        // An access that straddles the partially-addressable tail granule:
        // the magic lives one shadow byte further right.
        assert_eq!(BugKind::classify(5, HEAP_RIGHT_RZ), BugKind::HeapBufferOverflow);
        assert_eq!(BugKind::classify(3, GLOBAL_RZ), BugKind::GlobalBufferOverflow);
        assert_eq!(BugKind::classify(1, STACK_MID_RZ), BugKind::StackBufferOverflow);
    }

    #[test]
    fn heap_overflow_report_names_bug_and_region() {
        let ctx = test_ctx();
        let p = ctx.heap().allocate(ctx, 10, 8);
        let fault = p as usize + 10;
        assert_eq!(BugKind::for_addr(fault), BugKind::HeapBufferOverflow);

        let mut out = String::new();
        write_access_report(
            ctx,
            0x1000,
            0,
            0,
            fault,
            AccessInfo { size: 1, is_write: false },
            &mut out,
        );
        assert!(out.contains("heap-buffer-overflow"), "{out}");
        assert!(out.contains("READ of size 1"), "{out}");
        assert!(out.contains("0 bytes to the right of 10-byte region"), "{out}");
        ctx.heap().free(ctx, p);
    }

    #[test]
    fn use_after_free_report_shows_both_stacks() {
        let ctx = test_ctx();
        let p = ctx.heap().allocate(ctx, 40, 8);
        ctx.heap().free(ctx, p);
        assert_eq!(BugKind::for_addr(p as usize), BugKind::HeapUseAfterFree);

        let mut out = String::new();
        write_access_report(
            ctx,
            0x1000,
            0,
            0,
            p as usize,
            AccessInfo { size: 4, is_write: true },
            &mut out,
        );
        assert!(out.contains("heap-use-after-free"), "{out}");
        assert!(out.contains("WRITE of size 4"), "{out}");
        assert!(out.contains("freed by thread T"), "{out}");
        assert!(out.contains("previously allocated by thread T"), "{out}");
    }

    #[test]
    fn unrecognized_address_gets_the_fallback_line() {
        let ctx = test_ctx();
        let mut out = String::new();
        // A granule-aligned LowMem address nothing has ever touched.
        describe_address(ctx, 64 << SHADOW_SCALE, 1, &mut out);
        assert!(out.contains("is not tracked by any registry"), "{out}");
    }
}
