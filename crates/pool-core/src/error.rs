//! Error type for everything the pool can fail to do.
//!
//! Variants mirror `tailwind_pool_proto::ErrorKind` one-for-one via
//! [`PoolError::kind`] so a caller across a future IPC boundary can recover
//! the machine-readable reason without string matching.

use tailwind_pool_proto::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("request options are invalid for the active CLI version: {0}")]
    InvalidArgs(String),

    #[error("pool is saturated and no worker could be provisioned in time")]
    NoCapacity,

    #[error("worker failed to become ready: {0}")]
    StartupFailed(String),

    #[error("worker subprocess exited before producing output")]
    ExitBeforeOutput,

    #[error("timed out waiting for output after {0:?}")]
    Timeout(std::time::Duration),

    #[error("worker produced no output on any capture tier")]
    EmptyOutput,

    #[error("unsupported CLI version for this operation")]
    UnsupportedVersion,

    #[error("internal pool invariant violated: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::InvalidArgs(_) => ErrorKind::InvalidArgs,
            PoolError::NoCapacity => ErrorKind::NoCapacity,
            PoolError::StartupFailed(_) => ErrorKind::StartupFailed,
            PoolError::ExitBeforeOutput => ErrorKind::ExitBeforeOutput,
            PoolError::Timeout(_) => ErrorKind::Timeout,
            PoolError::EmptyOutput => ErrorKind::EmptyOutput,
            PoolError::UnsupportedVersion => ErrorKind::UnsupportedVersion,
            PoolError::Internal(_) => ErrorKind::Internal,
            PoolError::Io(_) => ErrorKind::Io,
        }
    }
}
