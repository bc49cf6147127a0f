//! Runtime configuration, read once at init from the `ASAN_OPTIONS`
//! environment variable. The variable is a single string in which `key=value`
//! pairs are located by substring search, so any separator (or none) works
//! between entries; unknown keys are ignored.

use core::ffi::CStr;

use crate::utils::check;

/// Hard cap on frames recorded per allocation; `malloc_context_size` may only
/// shrink it.
pub const MAX_MALLOC_CONTEXT: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct Flags {
    /// Captured frames per alloc/free stack.
    pub malloc_context_size: usize,
    /// Log verbosity; 0 is silent.
    pub verbosity: i64,
    /// Redzone bytes on each side of a heap chunk. Power of two, >= 32.
    pub redzone: usize,
    /// Print statistics on normal exit.
    pub atexit: bool,
    /// Master switch for shadow writes; disabling effectively bypasses
    /// detection.
    pub poison_shadow: bool,
    /// 0 = skip global registration, 1 = on, 2 = trace registrations.
    pub report_globals: i64,
    /// User sizes at or above this go to the direct-mmap path.
    pub large_malloc: usize,
    /// Demand-map shadow pages from the SIGSEGV handler instead of reserving
    /// them eagerly.
    pub lazy_shadow: bool,
    /// Install the SIGSEGV handler.
    pub handle_segv: bool,
    /// Print per-size-class statistics in reports.
    pub stats: bool,
    /// Symbolizer on/off (consumed by the external symbolizer).
    pub symbolize: bool,
    /// Demangler on/off (consumed by the external symbolizer).
    pub demangle: bool,
    /// Extra diagnostics in reports.
    pub debug: bool,
    /// Frame-pointer walk instead of the full unwinder.
    pub fast_unwind: bool,
    /// Multithreaded mode.
    pub mt: bool,
    /// Bytes of freed memory held poisoned before true release.
    pub quarantine_size: usize,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            malloc_context_size: MAX_MALLOC_CONTEXT,
            verbosity: 0,
            redzone: 128,
            atexit: false,
            poison_shadow: true,
            report_globals: 1,
            large_malloc: 1 << 31,
            lazy_shadow: false,
            handle_segv: true,
            stats: false,
            symbolize: true,
            demangle: true,
            debug: false,
            fast_unwind: true,
            mt: true,
            quarantine_size: 1 << 28,
        }
    }
}

impl Flags {
    pub fn from_env() -> Flags {
        let options = unsafe {
            let raw = libc::getenv(c"ASAN_OPTIONS".as_ptr());
            if raw.is_null() { None } else { CStr::from_ptr(raw).to_str().ok() }
        };
        Flags::parse(options)
    }

    pub fn parse(options: Option<&str>) -> Flags {
        let defaults = Flags::default();
        let flags = Flags {
            malloc_context_size: int_flag(
                options,
                "malloc_context_size=",
                defaults.malloc_context_size as i64,
            ) as usize,
            verbosity: int_flag(options, "verbosity=", defaults.verbosity),
            redzone: int_flag(options, "redzone=", defaults.redzone as i64) as usize,
            atexit: bool_flag(options, "atexit=", defaults.atexit),
            poison_shadow: bool_flag(options, "poison_shadow=", defaults.poison_shadow),
            report_globals: int_flag(options, "report_globals=", defaults.report_globals),
            large_malloc: int_flag(options, "large_malloc=", defaults.large_malloc as i64)
                as usize,
            lazy_shadow: bool_flag(options, "lazy_shadow=", defaults.lazy_shadow),
            handle_segv: bool_flag(options, "handle_segv=", defaults.handle_segv),
            stats: bool_flag(options, "stats=", defaults.stats),
            symbolize: bool_flag(options, "symbolize=", defaults.symbolize),
            demangle: bool_flag(options, "demangle=", defaults.demangle),
            debug: bool_flag(options, "debug=", defaults.debug),
            fast_unwind: bool_flag(options, "fast_unwind=", defaults.fast_unwind),
            mt: bool_flag(options, "mt=", defaults.mt),
            quarantine_size: int_flag(options, "quarantine_size=", defaults.quarantine_size as i64)
                as usize,
        };
        flags.validate();
        flags
    }

    fn validate(&self) {
        check!(self.redzone >= 32);
        check!(self.redzone.is_power_of_two());
        check!(self.malloc_context_size <= MAX_MALLOC_CONTEXT);
        // Lazy shadow is populated from the fault handler, so it cannot work
        // with the handler disabled.
        check!(self.handle_segv || !self.lazy_shadow);
    }
}

/// Locates `key=` in the option string and parses the decimal integer that
/// follows it. Missing keys fall back to the default.
fn int_flag(options: Option<&str>, key: &str, default: i64) -> i64 {
    let Some(options) = options else { return default };
    let Some(pos) = options.find(key) else { return default };
    let rest = &options[pos + key.len()..];
    let negative = rest.starts_with('-');
    let digits = if negative { &rest[1..] } else { rest };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        return default;
    }
    let value: i64 = digits[..end].parse().unwrap_or(default);
    if negative { -value } else { value }
}

fn bool_flag(options: Option<&str>, key: &str, default: bool) -> bool {
    int_flag(options, key, default as i64) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_options() {
        let flags = Flags::parse(None);
        assert_eq!(flags.redzone, 128);
        assert_eq!(flags.quarantine_size, 1 << 28);
        assert_eq!(flags.malloc_context_size, 30);
        assert!(flags.handle_segv);
        assert!(!flags.lazy_shadow);
    }

    #[test]
    fn substring_search_accepts_any_separator() {
        let flags = Flags::parse(Some("verbosity=2:redzone=64 atexit=1,stats=1"));
        assert_eq!(flags.verbosity, 2);
        assert_eq!(flags.redzone, 64);
        assert!(flags.atexit);
        assert!(flags.stats);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let flags = Flags::parse(Some("no_such_flag=7 poison_shadow=0"));
        assert!(!flags.poison_shadow);
        assert_eq!(flags.verbosity, 0);
    }

    #[test]
    fn garbage_value_falls_back_to_default() {
        let flags = Flags::parse(Some("verbosity=zebra"));
        assert_eq!(flags.verbosity, 0);
    }
}
