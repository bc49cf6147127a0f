#![cfg_attr(not(test), no_std)]
#![feature(sync_unsafe_cell)]
#![feature(thread_local)]
#![feature(allocator_api)]
#![allow(clippy::missing_safety_doc)]

//! Runtime core of an address sanity checker. Instrumented code compares
//! every load and store against a shadow byte; when the check fails, control
//! lands here (through a `ud2` trap or a direct report call) and the runtime
//! diagnoses the access, prints a report and aborts. The runtime also
//! interposes the libc allocation surface so heap objects grow poisoned
//! redzones and freed memory sits in quarantine, without recompiling the
//! application's dependencies.

extern crate alloc;

use core::ffi::c_char;

pub use addrsan_shared::mapping;

mod errors;
mod flags;
mod global;
mod globals;
mod heap;
mod hooks;
mod report;
mod shadow;
mod signals;
mod stack_trace;
mod stats;
mod thread;
mod utils;

#[cfg(not(test))]
mod interceptors;

pub use global::{GlobalCtx, global_ctx, init};

/// Mapping constants exported for consumers that cannot link the shared
/// crate (the instrumentation pass reads these from the binary).
#[unsafe(no_mangle)]
pub static __addrsan_mapping_scale: usize = mapping::SHADOW_SCALE;
#[unsafe(no_mangle)]
pub static __addrsan_mapping_offset: usize = mapping::SHADOW_OFFSET;

/// Idempotent runtime initialization; also run from the loader constructor
/// below and lazily from every interposed entry.
#[unsafe(no_mangle)]
pub extern "C" fn __addrsan_init() {
    global::init();
}

/// Called by instrumented module initializers once per global variable.
#[unsafe(no_mangle)]
pub extern "C" fn __addrsan_register_global(beg: usize, size: usize, name: *const c_char) {
    let ctx = global::ensure_ctx();
    ctx.globals().register(ctx, beg, size, name);
}

/// The allocator's contribution to reports, exported for external tooling.
#[unsafe(no_mangle)]
pub extern "C" fn __addrsan_describe_heap_address(addr: usize, access_size: usize) {
    use core::fmt::Write;
    let ctx = global::ensure_ctx();
    let mut out = global::BVec::new_in(ctx.allocator());
    if !ctx.heap().describe_addr(ctx, addr, access_size, &mut out) {
        let _ = writeln!(out, "{:#x} does not point into a known heap chunk", addr);
    }
    libc_print::std_name::eprint!("{}", core::str::from_utf8(&out).unwrap_or(""));
}

/// One exported entry per access code, for instrumentation sites that prefer
/// a call over a `ud2` trap.
macro_rules! report_error_entry {
    ($name:ident, $code:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn $name(addr: usize) -> ! {
            report::report_from_call($code, addr)
        }
    };
}

report_error_entry!(__addrsan_report_error_0, 0);
report_error_entry!(__addrsan_report_error_1, 1);
report_error_entry!(__addrsan_report_error_2, 2);
report_error_entry!(__addrsan_report_error_3, 3);
report_error_entry!(__addrsan_report_error_4, 4);
report_error_entry!(__addrsan_report_error_8, 8);
report_error_entry!(__addrsan_report_error_9, 9);
report_error_entry!(__addrsan_report_error_10, 10);
report_error_entry!(__addrsan_report_error_11, 11);
report_error_entry!(__addrsan_report_error_12, 12);

/// Initialize as early as the loader allows so module initializers that
/// register globals find the runtime up.
#[cfg(not(test))]
#[used]
#[unsafe(link_section = ".init_array")]
static INIT_CTOR: extern "C" fn() = {
    extern "C" fn ctor() {
        global::init();
    }
    ctor
};

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    libc_print::std_name::eprintln!("addrsan internal panic: {}", info);
    unsafe { libc::abort() }
}

/// The runtime must never allocate through a Rust global allocator: that
/// would recurse into the interposed malloc. Everything goes through the
/// explicit [`hooks::RtAlloc`] handles instead, and this placeholder turns
/// any accidental implicit allocation into an immediate abort.
#[cfg(not(test))]
mod global_alloc {
    use core::alloc::{GlobalAlloc, Layout};

    struct NoImplicitAlloc;

    unsafe impl GlobalAlloc for NoImplicitAlloc {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            panic!("implicit allocation in the sanitizer runtime")
        }
        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            panic!("implicit deallocation in the sanitizer runtime")
        }
    }

    #[global_allocator]
    static GLOBAL_ALLOCATOR: NoImplicitAlloc = NoImplicitAlloc;
}
