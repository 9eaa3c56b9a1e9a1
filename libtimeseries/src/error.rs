use thiserror::Error;

/// Errors produced while encoding or decoding the binary or text wire
/// formats.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("key too long: {len} bytes (must be < 65536)")]
    KeyTooLong { len: usize },

    #[error("truncated frame: needed {needed} bytes, only {available} remain")]
    Truncated { needed: usize, available: usize },

    #[error("bad magic: expected \"TSKBATCH\"")]
    BadMagic,

    #[error("unsupported version {found} (expected 0)")]
    BadVersion { found: u8 },

    #[error("zero-length key")]
    EmptyKey,
}

/// Errors a backend can report. Config errors are unrecoverable at this
/// layer, transport errors may be recoverable or sticky-fatal, and
/// `Unsupported` stands in for an `assert(0 && "Not implemented")` for
/// operations a backend chooses not to implement.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("config error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("fatal transport error: {0}")]
    Fatal(String),

    #[error("operation not supported by this backend")]
    Unsupported,

    #[error("unknown backend name {0:?}")]
    UnknownBackend(String),
}

/// Errors the Key Package surfaces. A flush failure on one backend does not
/// stop the KP from attempting the others; `Flush` carries how many of the
/// enabled backends failed.
#[derive(Debug, Error)]
pub enum KpError {
    #[error("{failed} of {attempted} backend(s) failed to flush")]
    Flush { failed: usize, attempted: usize },

    #[error("no such key id {0}")]
    UnknownKeyId(u32),
}
