//! The error type shared across the crate.

use std::sync::Arc;
use thiserror::Error;

/// Errors that cross a module boundary. Transient link failures are handled
/// inline by the prober/link code (they don't propagate — `spec.md` §7 makes
/// the tick itself infallible) and so mostly show up here via `Io`/`Protocol`
/// at the point a caller first observes them.
#[derive(Error, Debug, Clone)]
pub enum SentinelError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Not a real error: signals the codec that more bytes are needed.
    #[error("incomplete frame")]
    IncompleteFrame,

    #[error("connection timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("unknown master '{0}'")]
    UnknownMaster(String),

    #[error("NOQUORUM Not enough Sentinels to reach the majority and quorum needed to failover")]
    NoQuorum,

    #[error("INPROG Failover already in progress for this master")]
    FailoverInProgress,

    #[error("NOGOODSLAVE No suitable replica to promote")]
    NoGoodSlave,

    #[error("ERR {0}")]
    Command(String),
}

impl From<std::io::Error> for SentinelError {
    fn from(e: std::io::Error) -> Self {
        SentinelError::Io(Arc::new(e))
    }
}

impl From<std::num::ParseIntError> for SentinelError {
    fn from(e: std::num::ParseIntError) -> Self {
        SentinelError::Protocol(format!("invalid integer: {e}"))
    }
}

impl From<toml::de::Error> for SentinelError {
    fn from(e: toml::de::Error) -> Self {
        SentinelError::Config(e.to_string())
    }
}
