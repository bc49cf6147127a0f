use core::ffi::c_void;
use core::ptr;

use crate::errors::AllocError;

/// Internal-consistency assertion. A failed check means an impossible state,
/// not a detected application bug, so it prints its own location and aborts
/// without attempting a full report.
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            $crate::utils::check_failed(stringify!($cond), core::file!(), core::line!());
        }
    };
}
pub(crate) use check;

/// Verbosity-gated logging, all of it on stderr so it interleaves sanely with
/// reports.
macro_rules! verbose {
    ($ctx:expr, $level:expr, $($arg:tt)*) => {
        if $ctx.flags().verbosity >= $level {
            libc_print::std_name::eprintln!($($arg)*);
        }
    };
}
pub(crate) use verbose;

#[cold]
#[inline(never)]
pub(crate) fn check_failed(cond: &str, file: &str, line: u32) -> ! {
    libc_print::std_name::eprintln!("CHECK failed: {cond} at {file}:{line}");
    unsafe { libc::abort() }
}

#[inline]
pub(crate) const fn round_up_to(n: usize, divisor: usize) -> usize {
    debug_assert!(divisor.is_power_of_two());
    (n + divisor - 1) & !(divisor - 1)
}

#[inline]
pub(crate) const fn round_down_to(n: usize, divisor: usize) -> usize {
    debug_assert!(divisor.is_power_of_two());
    n & !(divisor - 1)
}

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Plain anonymous mapping at a kernel-chosen address. Used for metadata and
/// size-class regions; shadow regions go through [`mmap_fixed`].
pub(crate) unsafe fn mmap_anon(size: usize, what: &'static str) -> Result<*mut u8, AllocError> {
    let ptr = unsafe {
        raw_mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(AllocError::MmapFailed(what, size, errno()))
    } else {
        Ok(ptr.cast::<u8>())
    }
}

/// Fixed mapping for shadow regions. `MAP_FIXED` is deliberate: the target
/// ranges are reserved for the sanitizer by the mapping contract and must not
/// drift.
pub(crate) unsafe fn mmap_fixed(
    beg: usize,
    size: usize,
    prot: i32,
    what: &'static str,
) -> Result<(), AllocError> {
    let ptr = unsafe {
        raw_mmap(
            beg as *mut c_void,
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(AllocError::MmapFailed(what, size, errno()))
    } else {
        check!(ptr as usize == beg);
        Ok(())
    }
}

pub(crate) unsafe fn raw_munmap(ptr: *mut u8, size: usize) {
    let rc = unsafe { libc::munmap(ptr.cast::<c_void>(), size) };
    check!(rc == 0);
}

/// Issues the mmap syscall directly so that nothing can interpose between the
/// runtime and the kernel.
unsafe fn raw_mmap(addr: *mut c_void, len: usize, prot: i32, flags: i32) -> *mut c_void {
    unsafe { libc::syscall(libc::SYS_mmap, addr, len, prot, flags, -1i32, 0usize) as *mut c_void }
}

pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub(crate) fn getpid() -> i32 {
    unsafe { libc::getpid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up_to(0, 8), 0);
        assert_eq!(round_up_to(1, 8), 8);
        assert_eq!(round_up_to(8, 8), 8);
        assert_eq!(round_up_to(9, 128), 128);
        assert_eq!(round_down_to(9, 8), 8);
        assert_eq!(round_down_to(8, 8), 8);
    }

    #[test]
    fn anonymous_mapping_round_trip() {
        let size = page_size();
        let ptr = unsafe { mmap_anon(size, "test").unwrap() };
        unsafe {
            ptr.write(42);
            assert_eq!(ptr.read(), 42);
            raw_munmap(ptr, size);
        }
    }
}
