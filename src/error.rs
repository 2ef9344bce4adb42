//! Error types for the persistent-memory runtime.
//!
//! Only conditions a caller can meaningfully classify are surfaced as
//! [`NvError`]. Programmer misuse (operating on a deleted region, mapping at
//! the wrong address) and unrecoverable I/O failures abort with a diagnostic
//! instead; recovery is the only retry mechanism for those.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NvError>;

/// Errors returned by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum NvError {
    /// Underlying file or mapping I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Named region does not exist (or is deleted and the lookup was not a
    /// recovery lookup).
    #[error("region not found: {0}")]
    RegionNotFound(String),

    /// `create` was asked for a name that already maps to a live region.
    #[error("region already exists: {0}")]
    RegionExists(String),

    /// Region names must fit in 31 bytes.
    #[error("region name too long: {0}")]
    RegionNameTooLong(String),

    /// The region table has no free slots left.
    #[error("region table is full")]
    TooManyRegions,

    /// More threads than the runtime supports touched the logger.
    #[error("too many concurrent threads")]
    TooManyThreads,

    /// `log_store` only supports stores up to 128 bits.
    #[error("store of {0} bits is wider than the logger supports")]
    StoreTooWide(u32),

    /// The log region ran out of space for entries or side-buffers.
    #[error("log region exhausted")]
    LogFull,

    /// A region's heap ran out of space.
    #[error("region heap exhausted")]
    OutOfMemory,

    /// An operation that requires an initialized singleton found none.
    #[error("runtime instance not initialized")]
    NoInstance,

    /// The log region header did not carry the expected magic.
    #[error("log region is corrupt: {0}")]
    CorruptLog(&'static str),

    /// Configuration loading failed.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NvError::RegionNotFound("scratch".to_string());
        assert!(format!("{err}").contains("scratch"));

        let err = NvError::StoreTooWide(256);
        assert!(format!("{err}").contains("256"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: NvError = io.into();
        assert!(matches!(err, NvError::Io(_)));
    }
}
