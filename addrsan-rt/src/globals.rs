//! Registry of instrumented global variables. Module initializers emitted by
//! the instrumentation pass call in here once per global (possibly more than
//! once, so registration is an upsert); the right redzone the pass reserved
//! after each global gets poisoned at registration time.

use addrsan_shared::mapping::{SHADOW_GRANULARITY, addr_is_in_mem, mem_to_shadow};
use addrsan_shared::poison::GLOBAL_RZ;
use core::ffi::{CStr, c_char};
use core::fmt::Write;
use spin::mutex::SpinMutex;

use libc_print::std_name::eprintln;

use crate::global::{BVec, GlobalCtx};
use crate::shadow::{poison_partial_right_redzone, poison_region};
use crate::utils::{check, round_up_to};

/// One registered global. `name` points into the instrumented module's
/// constant data and lives as long as the process.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub beg: usize,
    pub size: usize,
    name: *const c_char,
}

unsafe impl Send for Global {}

impl Global {
    fn name(&self) -> &str {
        if self.name.is_null() {
            return "<unknown>";
        }
        unsafe { CStr::from_ptr(self.name) }.to_str().unwrap_or("<non-utf8>")
    }

    /// The size including the alignment padding the redzone granule imposes.
    fn aligned_size(&self, granule: usize) -> usize {
        round_up_to(self.size, granule)
    }
}

/// Ordered map from `beg` to descriptor, kept as a sorted vector: lookups
/// during reporting scan it anyway, and registration is rare.
#[derive(Debug)]
pub struct GlobalRegistry {
    entries: SpinMutex<BVec<Global>>,
}

impl GlobalRegistry {
    pub fn new(alloc: crate::hooks::RtAlloc) -> GlobalRegistry {
        GlobalRegistry { entries: SpinMutex::new(BVec::new_in(alloc)) }
    }

    /// Registers or re-registers the global at `beg` and poisons its right
    /// redzone.
    pub fn register(&self, ctx: &GlobalCtx, beg: usize, size: usize, name: *const c_char) {
        if ctx.flags().report_globals == 0 {
            return;
        }
        check!(addr_is_in_mem(beg));
        check!(beg % SHADOW_GRANULARITY == 0);
        let global = Global { beg, size, name };
        if ctx.flags().report_globals >= 2 {
            eprintln!("Added Global: beg={:#x} size={} name={}", beg, size, global.name());
        }
        self.poison_right_redzone(ctx, &global);

        let mut entries = self.entries.lock();
        match entries.binary_search_by_key(&beg, |g| g.beg) {
            Ok(i) => entries[i] = global,
            Err(i) => entries.insert(i, global),
        }
    }

    /// Stamps the full trailing redzone granules and, when the size is not a
    /// granule multiple, the partial boundary granule.
    fn poison_right_redzone(&self, ctx: &GlobalCtx, global: &Global) {
        let granule = ctx.flags().redzone;
        let aligned = global.aligned_size(granule);
        poison_region(ctx, global.beg + aligned, granule, GLOBAL_RZ);
        if global.size % granule != 0 && ctx.flags().poison_shadow {
            let boundary = global.beg + aligned - granule;
            unsafe {
                poison_partial_right_redzone(
                    mem_to_shadow(boundary) as *mut u8,
                    global.size % granule,
                    granule,
                    SHADOW_GRANULARITY,
                    GLOBAL_RZ,
                );
            }
        }
    }

    /// Writes a location line for every registered global whose redzone-padded
    /// span contains `addr`. Returns true if anything matched. Takes only a
    /// try-lock: when called from a signal handler that interrupted a
    /// registration, degrading beats deadlocking.
    pub fn describe_addr(&self, ctx: &GlobalCtx, addr: usize, out: &mut dyn Write) -> bool {
        if ctx.flags().report_globals == 0 {
            return false;
        }
        let Some(entries) = self.entries.try_lock() else {
            let _ = writeln!(out, "  (global registry busy, description skipped)");
            return false;
        };
        let granule = ctx.flags().redzone;
        let mut matched = false;
        for global in entries.iter() {
            if ctx.flags().report_globals >= 2 {
                eprintln!(
                    "Search Global: beg={:#x} size={} name={}",
                    global.beg,
                    global.size,
                    global.name()
                );
            }
            matched |= describe_if_in_span(global, granule, addr, out);
        }
        matched
    }
}

fn describe_if_in_span(global: &Global, granule: usize, addr: usize, out: &mut dyn Write) -> bool {
    let aligned = global.aligned_size(granule);
    if addr < global.beg.saturating_sub(granule) || addr >= global.beg + aligned + granule {
        return false;
    }
    let _ = write!(out, "{:#x} is located ", addr);
    if addr < global.beg {
        let _ = write!(out, "{} bytes to the left", global.beg - addr);
    } else if addr >= global.beg + global.size {
        let _ = write!(out, "{} bytes to the right", addr - (global.beg + global.size));
    } else {
        let _ = write!(out, "{} bytes inside", addr - global.beg);
    }
    let _ = writeln!(
        out,
        " of global variable '{}' ({:#x}) of size {}",
        global.name(),
        global.beg,
        global.size
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::test_ctx;
    use crate::shadow::shadow_byte;
    use alloc::string::String;

    // Instrumented globals are 8-aligned with a redzone-sized gap after them;
    // modelled here by a padded static.
    #[repr(C, align(8))]
    struct PaddedGlobal {
        data: [u8; 5],
        _pad: [u8; 256 + 3],
    }
    static G: PaddedGlobal = PaddedGlobal { data: [0; 5], _pad: [0; 259] };

    #[test]
    fn register_poisons_right_redzone_and_describe_finds_it() {
        let ctx = test_ctx();
        let beg = G.data.as_ptr() as usize;
        ctx.globals().register(ctx, beg, 5, c"G".as_ptr());

        let granule = ctx.flags().redzone;
        // Partial boundary granule: 5 addressable bytes.
        assert_eq!(shadow_byte(beg), 5);
        // The rest of the boundary granule and the full granule after it are
        // poisoned.
        assert_eq!(shadow_byte(beg + SHADOW_GRANULARITY), GLOBAL_RZ);
        assert_eq!(shadow_byte(beg + granule), GLOBAL_RZ);

        // Every address in the padded span identifies the global.
        let aligned = round_up_to(5, granule);
        for addr in [beg.saturating_sub(granule), beg, beg + 4, beg + 5, beg + aligned + granule - 1]
        {
            let mut out = String::new();
            assert!(ctx.globals().describe_addr(ctx, addr, &mut out), "{addr:#x}");
            assert!(out.contains("global variable 'G'"), "{out}");
        }
        let mut out = String::new();
        assert!(!ctx.globals().describe_addr(ctx, beg + aligned + granule, &mut out));
    }

    #[test]
    fn describe_wording_matches_position() {
        let ctx = test_ctx();
        let beg = G.data.as_ptr() as usize;
        ctx.globals().register(ctx, beg, 5, c"G".as_ptr());

        let mut out = String::new();
        ctx.globals().describe_addr(ctx, beg + 5, &mut out);
        assert!(out.contains("0 bytes to the right of global variable 'G'"), "{out}");

        out.clear();
        ctx.globals().describe_addr(ctx, beg + 2, &mut out);
        assert!(out.contains("2 bytes inside of global variable 'G'"), "{out}");

        out.clear();
        ctx.globals().describe_addr(ctx, beg - 1, &mut out);
        assert!(out.contains("1 bytes to the left of global variable 'G'"), "{out}");
    }

    #[test]
    fn registration_is_idempotent() {
        let ctx = test_ctx();
        let beg = G.data.as_ptr() as usize;
        ctx.globals().register(ctx, beg, 5, c"G".as_ptr());
        ctx.globals().register(ctx, beg, 5, c"G".as_ptr());
        let mut out = String::new();
        ctx.globals().describe_addr(ctx, beg, &mut out);
        // One entry, one line.
        assert_eq!(out.lines().count(), 1, "{out}");
    }
}
