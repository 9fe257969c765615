//! Error types for rudis-pool
//!
//! Transient acquire failures (pool timeout, dial errors) surface to the
//! caller; connection-quality problems are absorbed by the pool, which
//! evicts the offending connection and retries or re-dials.

use thiserror::Error;

/// Result type for rudis-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rudis-pool
///
/// All payloads are plain strings so the error is `Clone`; the pool keeps
/// the most recent dial error around and hands out copies of it while the
/// dial circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Any operation on a closed pool returns this error.
    #[error("rudis: client is closed")]
    Closed,

    /// Timed out waiting for a connection from the pool.
    #[error("rudis: connection pool timeout")]
    PoolTimeout,

    /// The dialer failed to produce a connection.
    #[error("dial error: {0}")]
    Dial(String),

    /// A connection was found unusable (unread data, broken socket).
    #[error("bad connection: {0}")]
    BadConn(String),

    /// An I/O error, stringified at the boundary.
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Create a dial error
    pub fn dial(message: impl Into<String>) -> Self {
        Self::Dial(message.into())
    }

    /// Create a bad-connection error
    pub fn bad_conn(message: impl Into<String>) -> Self {
        Self::BadConn(message.into())
    }

    /// Whether the operation that produced this error is worth retrying
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::PoolTimeout | Self::Dial(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::PoolTimeout.is_retriable());
        assert!(Error::dial("refused").is_retriable());
        assert!(Error::Io("reset".into()).is_retriable());

        assert!(!Error::Closed.is_retriable());
        assert!(!Error::bad_conn("unread data").is_retriable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Closed.to_string(), "rudis: client is closed");
        assert_eq!(
            Error::PoolTimeout.to_string(),
            "rudis: connection pool timeout"
        );
        assert!(Error::dial("refused").to_string().contains("refused"));
    }

    #[test]
    fn test_error_from_io() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("reset by peer"));
    }
}
