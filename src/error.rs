use anyhow::Error as AnyhowError;
use thiserror::Error;

/// Result alias for errors emitted by leaklint internals.
pub type LeakResult<T> = Result<T, LeakLintError>;

/// Structured error type for leaklint subsystems.
#[derive(Debug, Error)]
pub enum LeakLintError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource model failure: {0}")]
    Resource(String),

    #[error("malformed input: {0}")]
    Input(String),

    #[error("{0}")]
    Other(String),
}

impl LeakLintError {
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Convert to anyhow::Error for interop with anyhow-based code.
    pub fn into_anyhow(self) -> AnyhowError {
        AnyhowError::new(self)
    }
}

impl From<AnyhowError> for LeakLintError {
    fn from(err: AnyhowError) -> Self {
        LeakLintError::other(err.to_string())
    }
}

/// Convenience macro mirroring `anyhow::bail!` but returning LeakLintError.
#[macro_export]
macro_rules! leaklint_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::LeakLintError::other(format!($($arg)*)));
    };
}

/// Convenience macro mirroring `anyhow::ensure!`.
#[macro_export]
macro_rules! leaklint_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::leaklint_bail!($($arg)*);
        }
    };
}

/// Utility for pretty printing aggregated errors inside tests.
pub fn format_error_chain(err: &LeakLintError) -> String {
    format!("{err}")
}
