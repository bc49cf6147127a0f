use thiserror_no_std::Error;

/// Failures of the runtime's own resource acquisition. Detected application
/// bugs never surface as errors; those are terminal and go through the
/// reporter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("failed to mmap {1} bytes of {0} (errno {2})")]
    MmapFailed(&'static str, usize, i32),
    #[error("real symbol `{0}` could not be resolved")]
    SymbolMissing(&'static str),
}

pub type AllocResult<T> = Result<T, AllocError>;
