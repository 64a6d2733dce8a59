//! Stream error taxonomy shared by every block.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("event query timed out")]
    Timeout,

    #[error("stream disconnected")]
    Disconnected,

    #[error("attribute reconcile failed: {0}")]
    Reconcile(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("packet overflow")]
    Overflow,

    #[error("invalid cookie {0:#x}")]
    InvalidCookie(u64),

    #[error("hardware operation failed: {0}")]
    Hardware(String),

    #[error("fence wait timed out")]
    FenceTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Io(e.to_string())
    }
}

impl StreamError {
    /// Short status tag used in wire messages and one-line diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Timeout => "timeout",
            StreamError::Disconnected => "disconnect",
            StreamError::Reconcile(_) => "reconcile",
            StreamError::Config(_) => "config",
            StreamError::Protocol(_) => "protocol",
            StreamError::Overflow => "overflow",
            StreamError::InvalidCookie(_) => "cookie",
            StreamError::Hardware(_) => "hardware",
            StreamError::FenceTimeout => "fence-timeout",
            StreamError::Transport(_) => "transport",
            StreamError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_tags() {
        assert_eq!(StreamError::Overflow.code(), "overflow");
        assert_eq!(StreamError::InvalidCookie(7).code(), "cookie");
        assert_eq!(StreamError::Timeout.code(), "timeout");
    }

    #[test]
    fn io_errors_convert() {
        let e: StreamError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(e.code(), "io");
    }
}
