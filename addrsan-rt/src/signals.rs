//! The runtime's two signals. SIGILL carries failed shadow checks encoded by
//! the instrumentation (`ud2` plus an immediate naming size and direction);
//! SIGSEGV is either a lazily-mapped shadow page fault (resume) or a genuine
//! crash (report). Both handlers are installed through the *real* sigaction,
//! and the interposed `signal`/`sigaction` keep applications from taking
//! these signals back.

use addrsan_shared::AccessInfo;
use core::ffi::{c_int, c_void};
use core::mem;

use crate::global::GlobalCtx;
use crate::report;
use crate::shadow::lazy_map_shadow_chunk;
use crate::utils::{check, verbose};

/// Signals owned exclusively by the runtime.
pub(crate) fn is_owned_signal(signum: c_int) -> bool {
    signum == libc::SIGSEGV || signum == libc::SIGILL
}

pub(crate) fn install(ctx: &GlobalCtx) {
    if ctx.flags().handle_segv {
        install_handler(ctx, libc::SIGSEGV, on_sigsegv);
    } else {
        // Lazy shadow is populated from this handler; without it the first
        // shadow access would crash uninformatively.
        check!(!ctx.flags().lazy_shadow);
    }
    install_handler(ctx, libc::SIGILL, on_sigill);
    verbose!(ctx, 1, "addrsan: signal handlers installed");
}

type Handler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

fn install_handler(ctx: &GlobalCtx, signum: c_int, handler: Handler) {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        let rc = (ctx.hooks().sigaction)(signum, &action, core::ptr::null_mut());
        check!(rc == 0);
    }
}

extern "C" fn on_sigsegv(_signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let ctx = unsafe { crate::global::global_ctx() };
    let addr = unsafe { (*info).si_addr() } as usize;
    if lazy_map_shadow_chunk(ctx, addr) {
        return;
    }
    // First line through raw write: it must come out even if the heap or the
    // formatter is the thing that is broken.
    banner(b"ASAN:SIGSEGV\n");
    let (pc, sp, bp, ax) = registers_from_context(context);
    report::report_unknown_crash(ctx, pc, sp, bp, ax, addr);
}

extern "C" fn on_sigill(_signum: c_int, _info: *mut libc::siginfo_t, context: *mut c_void) {
    let ctx = unsafe { crate::global::global_ctx() };
    banner(b"ASAN:SIGILL\n");
    let (pc, sp, bp, ax) = registers_from_context(context);

    // The instrumentation emits `ud2; .byte imm` for a failed check, with
    // the faulting address parked in the accumulator.
    let insn = pc as *const u8;
    let imm = unsafe {
        check!(insn.read() == 0x0f && insn.add(1).read() == 0x0b);
        insn.add(2).read()
    };
    let Some(access) = AccessInfo::from_ud2_imm(imm) else {
        crate::utils::check_failed("valid access code after ud2", file!(), line!());
    };
    report::report_access_error(ctx, pc, bp, sp, ax, access);
}

fn banner(msg: &[u8]) {
    let written = unsafe { libc::write(2, msg.as_ptr().cast::<c_void>(), msg.len()) };
    if written != msg.len() as isize {
        unsafe { libc::abort() };
    }
}

// Program counter, stack pointer, frame pointer and accumulator from the
// saved machine context; the only platform-specific corner of the trap path.
cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        fn registers_from_context(context: *mut c_void) -> (usize, usize, usize, usize) {
            unsafe {
                let ucontext = context as *const libc::ucontext_t;
                let gregs = &(*ucontext).uc_mcontext.gregs;
                (
                    gregs[libc::REG_RIP as usize] as usize,
                    gregs[libc::REG_RSP as usize] as usize,
                    gregs[libc::REG_RBP as usize] as usize,
                    gregs[libc::REG_RAX as usize] as usize,
                )
            }
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        fn registers_from_context(context: *mut c_void) -> (usize, usize, usize, usize) {
            unsafe {
                let ucontext = context as *const libc::ucontext_t;
                let mcontext = &(*ucontext).uc_mcontext;
                (
                    mcontext.pc as usize,
                    mcontext.sp as usize,
                    mcontext.regs[29] as usize,
                    mcontext.regs[0] as usize,
                )
            }
        }
    } else {
        fn registers_from_context(_context: *mut c_void) -> (usize, usize, usize, usize) {
            (0, 0, 0, 0)
        }
    }
}
