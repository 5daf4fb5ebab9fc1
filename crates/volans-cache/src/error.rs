use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache-file failures are non-fatal by policy: callers log them and treat
/// the file as absent.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache file: {0}")]
    Corrupt(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
