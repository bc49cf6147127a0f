//! Reserving the shadow regions with the OS and writing poison values into
//! them. The arithmetic itself lives in `addrsan_shared::mapping`; this
//! module owns the pages.

use addrsan_shared::mapping::{
    HIGH_SHADOW_BEG, HIGH_SHADOW_END, LOW_SHADOW_BEG, LOW_SHADOW_END, SHADOW_GAP_BEG,
    SHADOW_GAP_END, SHADOW_GRANULARITY, addr_is_in_shadow, mem_to_shadow,
};
use libc_print::std_name::eprintln;

use crate::global::GlobalCtx;
use crate::stats::AsanStats;
use crate::utils::{check, getpid, mmap_fixed, page_size, verbose};

/// Size of the chunk faulted in around a lazily-mapped shadow address.
const LAZY_SHADOW_CHUNK: usize = 4 << 20;

/// Reserves the shadow address space. Eager mode maps both shadow regions up
/// front (the low shadow with one extra leading page, so arithmetic slightly
/// below the region stays in bounds); lazy mode leaves them to the SIGSEGV
/// handler. The gap is protected in either mode.
pub(crate) fn map_shadow_regions(ctx: &GlobalCtx) {
    let pg = page_size();
    if !ctx.flags().lazy_shadow {
        mmap_shadow_range(ctx, LOW_SHADOW_BEG - pg, LOW_SHADOW_END, "LowShadow");
        mmap_shadow_range(ctx, HIGH_SHADOW_BEG, HIGH_SHADOW_END, "HighShadow");
    }
    protect_range(ctx, SHADOW_GAP_BEG, SHADOW_GAP_END);
    verbose!(ctx, 1, "addrsan: shadow mapped (lazy={})", ctx.flags().lazy_shadow);
}

/// Demand-maps the shadow chunk containing `addr`. Returns false when the
/// address is not a shadow address or lazy mode is off, in which case the
/// fault is a real crash.
pub(crate) fn lazy_map_shadow_chunk(ctx: &GlobalCtx, addr: usize) -> bool {
    if !ctx.flags().lazy_shadow || !addr_is_in_shadow(addr) {
        return false;
    }
    let chunk = addr & !(LAZY_SHADOW_CHUNK - 1);
    if unsafe { mmap_fixed(chunk, LAZY_SHADOW_CHUNK, libc::PROT_READ | libc::PROT_WRITE, "shadow") }
        .is_err()
    {
        out_of_memory_abort(ctx, "shadow", LAZY_SHADOW_CHUNK);
    }
    AsanStats::bump(&ctx.stats().mmaps, 1);
    AsanStats::bump(&ctx.stats().mmaped, LAZY_SHADOW_CHUNK);
    true
}

/// Maps the end-inclusive page-aligned range `[beg, end]` read-write.
fn mmap_shadow_range(ctx: &GlobalCtx, beg: usize, end: usize, what: &'static str) {
    let pg = page_size();
    check!(beg % pg == 0);
    check!((end + 1) % pg == 0);
    let size = end - beg + 1;
    if unsafe { mmap_fixed(beg, size, libc::PROT_READ | libc::PROT_WRITE, what) }.is_err() {
        out_of_memory_abort(ctx, what, size);
    }
    AsanStats::bump(&ctx.stats().mmaps, 1);
    AsanStats::bump(&ctx.stats().mmaped, size);
}

/// The gap must never be touched: any access there is a runtime bug or a wild
/// pointer, and the SIGSEGV handler turns it into an unknown-crash report.
fn protect_range(ctx: &GlobalCtx, beg: usize, end: usize) {
    let pg = page_size();
    check!(beg % pg == 0);
    check!((end + 1) % pg == 0);
    if unsafe { mmap_fixed(beg, end - beg + 1, libc::PROT_NONE, "ShadowGap") }.is_err() {
        out_of_memory_abort(ctx, "ShadowGap", end - beg + 1);
    }
}

#[cold]
fn out_of_memory_abort(ctx: &GlobalCtx, what: &str, size: usize) -> ! {
    eprintln!(
        "=={}== ERROR: failed to allocate {:#x} ({}) bytes of {}",
        getpid(),
        size,
        size,
        what
    );
    ctx.print_stats();
    unsafe { libc::abort() }
}

/// Stamps `magic` over the shadow of `[addr, addr + size)`. Both bounds must
/// be granule-aligned; partial tails go through
/// [`poison_partial_right_redzone`].
pub(crate) fn poison_region(ctx: &GlobalCtx, addr: usize, size: usize, magic: u8) {
    if !ctx.flags().poison_shadow {
        return;
    }
    check!(addr % SHADOW_GRANULARITY == 0);
    check!(size % SHADOW_GRANULARITY == 0);
    unsafe {
        core::ptr::write_bytes(
            mem_to_shadow(addr) as *mut u8,
            magic,
            size >> addrsan_shared::mapping::SHADOW_SCALE,
        );
    }
}

/// Marks `[addr, addr + size)` fully addressable. `addr` must be
/// granule-aligned; a non-multiple size ends in a partial shadow byte.
pub(crate) fn unpoison_region(ctx: &GlobalCtx, addr: usize, size: usize) {
    if !ctx.flags().poison_shadow {
        return;
    }
    check!(addr % SHADOW_GRANULARITY == 0);
    let shadow = mem_to_shadow(addr) as *mut u8;
    unsafe {
        core::ptr::write_bytes(shadow, 0, size / SHADOW_GRANULARITY);
        let tail = size % SHADOW_GRANULARITY;
        if tail != 0 {
            shadow.add(size / SHADOW_GRANULARITY).write(tail as u8);
        }
    }
}

/// Poisons the shadow of a region whose addressable prefix ends mid-granule.
///
/// `shadow` covers `span` application bytes starting at a granule boundary;
/// the first `addressable` of them remain usable. The boundary granule gets
/// the partial count, every granule past it gets `magic`. Operates on a raw
/// shadow pointer so the same routine serves heap and global redzones (and
/// plain buffers in tests).
pub(crate) unsafe fn poison_partial_right_redzone(
    shadow: *mut u8,
    addressable: usize,
    span: usize,
    granularity: usize,
    magic: u8,
) {
    let mut offset = 0;
    let mut shadow = shadow;
    while offset < span {
        let byte = if offset + granularity <= addressable {
            0
        } else if offset >= addressable {
            magic
        } else {
            (addressable - offset) as u8
        };
        unsafe {
            shadow.write(byte);
            shadow = shadow.add(1);
        }
        offset += granularity;
    }
}

/// Reads the shadow byte covering `addr`. Callers must have classified the
/// address as application memory first.
pub(crate) fn shadow_byte(addr: usize) -> u8 {
    unsafe { (mem_to_shadow(addr) as *const u8).read() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_right_redzone_bytes() {
        let mut shadow = [0xaau8; 16];
        // 13 addressable bytes in a 32-byte span: one full granule, one
        // partial of 5, two fully poisoned.
        unsafe {
            poison_partial_right_redzone(shadow.as_mut_ptr(), 13, 32, SHADOW_GRANULARITY, 0xf9);
        }
        assert_eq!(&shadow[..4], &[0, 5, 0xf9, 0xf9]);
        assert_eq!(shadow[4], 0xaa);
    }

    #[test]
    fn partial_right_redzone_exact_fit_stays_clean() {
        let mut shadow = [0xaau8; 8];
        unsafe {
            poison_partial_right_redzone(shadow.as_mut_ptr(), 16, 16, SHADOW_GRANULARITY, 0xf9);
        }
        assert_eq!(&shadow[..2], &[0, 0]);
    }

    #[test]
    fn partial_right_redzone_zero_addressable_is_all_magic() {
        let mut shadow = [0u8; 4];
        unsafe {
            poison_partial_right_redzone(shadow.as_mut_ptr(), 0, 24, SHADOW_GRANULARITY, 0xfb);
        }
        assert_eq!(&shadow[..3], &[0xfb, 0xfb, 0xfb]);
    }
}
