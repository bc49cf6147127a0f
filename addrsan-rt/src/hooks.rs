//! Pointers to the real libc entry points the runtime wraps, resolved with
//! `dlsym(RTLD_NEXT)` during init, plus the allocator handle the runtime's
//! own metadata lives on and the bootstrap pool that serves the dynamic
//! linker while resolution is still in progress.

use alloc::alloc::{AllocError, Allocator, Layout};
use core::cell::SyncUnsafeCell;
use core::ffi::{c_char, c_int, c_void};
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{AllocError as RtError, AllocResult};
use crate::utils::check;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type SignalFn = unsafe extern "C" fn(c_int, libc::sighandler_t) -> libc::sighandler_t;
pub type SigactionFn =
    unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;
pub type LongjmpFn = unsafe extern "C" fn(*mut c_void, c_int);
pub type CxaThrowFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void);
pub type ThreadRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
pub type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    ThreadRoutine,
    *mut c_void,
) -> c_int;

/// The real functions hiding behind the interposed symbols.
#[derive(Debug, Clone, Copy)]
pub struct RealHooks {
    pub alloc: RtAlloc,
    pub signal: SignalFn,
    pub sigaction: SigactionFn,
    pub longjmp: LongjmpFn,
    pub siglongjmp: LongjmpFn,
    /// Absent in processes that never loaded a C++ runtime.
    pub cxa_throw: Option<CxaThrowFn>,
    pub pthread_create: PthreadCreateFn,
}

impl RealHooks {
    /// Resolves every wrapped symbol. The dynamic linker may allocate while
    /// we do this; those requests land in the bootstrap pool because the
    /// runtime is not yet marked initialized.
    pub fn resolve() -> AllocResult<RealHooks> {
        unsafe {
            Ok(RealHooks {
                alloc: RtAlloc {
                    malloc: mem::transmute::<*mut c_void, MallocFn>(next_symbol(c"malloc")?),
                    free: mem::transmute::<*mut c_void, FreeFn>(next_symbol(c"free")?),
                },
                signal: mem::transmute::<*mut c_void, SignalFn>(next_symbol(c"signal")?),
                sigaction: mem::transmute::<*mut c_void, SigactionFn>(next_symbol(
                    c"sigaction",
                )?),
                longjmp: mem::transmute::<*mut c_void, LongjmpFn>(next_symbol(c"longjmp")?),
                siglongjmp: mem::transmute::<*mut c_void, LongjmpFn>(next_symbol(
                    c"siglongjmp",
                )?),
                cxa_throw: {
                    let sym = libc::dlsym(libc::RTLD_NEXT, c"__cxa_throw".as_ptr());
                    if sym.is_null() {
                        None
                    } else {
                        Some(mem::transmute::<*mut c_void, CxaThrowFn>(sym))
                    }
                },
                pthread_create: mem::transmute::<*mut c_void, PthreadCreateFn>(next_symbol(
                    c"pthread_create",
                )?),
            })
        }
    }
}

unsafe fn next_symbol(name: &'static core::ffi::CStr) -> AllocResult<*mut c_void> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
    if sym.is_null() {
        Err(RtError::SymbolMissing(name.to_str().unwrap_or("?")))
    } else {
        Ok(sym)
    }
}

/// Allocator handle over the real `malloc`/`free`. Everything the runtime
/// itself allocates (registries, depot, chunk indices) goes through this, so
/// runtime metadata is never wrapped in redzones and never quarantined.
#[derive(Debug, Clone, Copy)]
pub struct RtAlloc {
    malloc: MallocFn,
    free: FreeFn,
}

unsafe impl Allocator for RtAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        unsafe {
            match layout.size() {
                0 => Ok(NonNull::slice_from_raw_parts(layout.dangling_ptr(), 0)),
                size => {
                    let ptr = (self.malloc)(size);
                    if ptr.is_null() {
                        return Err(AllocError);
                    }
                    Ok(NonNull::slice_from_raw_parts(NonNull::new_unchecked(ptr.cast()), size))
                }
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { (self.free)(ptr.as_ptr().cast::<c_void>()) }
    }
}

// The dynamic linker calls calloc while dlsym is resolving the real
// allocator, so those first requests are served from a fixed arena that is
// never freed. Sized for what the linker actually asks for.
const BOOTSTRAP_POOL_BYTES: usize = 8 << 10;

#[repr(align(16))]
struct BootstrapPool([u8; BOOTSTRAP_POOL_BYTES]);

static BOOTSTRAP_POOL: SyncUnsafeCell<BootstrapPool> =
    SyncUnsafeCell::new(BootstrapPool([0; BOOTSTRAP_POOL_BYTES]));
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn bootstrap_alloc(size: usize) -> *mut c_void {
    let size = crate::utils::round_up_to(size.max(1), 16);
    let offset = BOOTSTRAP_USED.fetch_add(size, Ordering::Relaxed);
    check!(offset + size <= BOOTSTRAP_POOL_BYTES);
    unsafe { (BOOTSTRAP_POOL.get() as *mut u8).add(offset).cast::<c_void>() }
}

/// Pointers from the bootstrap pool are never freed; `free` ignores them.
pub(crate) fn is_bootstrap_ptr(ptr: *const c_void) -> bool {
    let beg = BOOTSTRAP_POOL.get() as usize;
    let addr = ptr as usize;
    addr >= beg && addr < beg + BOOTSTRAP_POOL_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_real_symbols() {
        let hooks = RealHooks::resolve().unwrap();
        // The resolved malloc must actually allocate.
        unsafe {
            let p = (hooks.alloc.malloc)(32);
            assert!(!p.is_null());
            (hooks.alloc.free)(p);
        }
    }

    #[test]
    fn bootstrap_pool_serves_and_recognizes_pointers() {
        let p = bootstrap_alloc(24);
        assert!(!p.is_null());
        assert!(is_bootstrap_ptr(p));
        assert_eq!(p as usize % 16, 0);
        let q = bootstrap_alloc(1);
        assert_ne!(p, q);
        assert!(!is_bootstrap_ptr(core::ptr::null()));
    }
}
