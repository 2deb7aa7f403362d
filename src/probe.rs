//! The seam between the scan pipeline and whatever performs the actual check.
use async_trait::async_trait;
use std::io;
use thiserror::Error;

use crate::types::Target;

/// What a completed check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The server did not over-read.
    Safe,
    /// The server echoed back more than it was sent.
    Vulnerable { leaked: usize },
}

/// Why a check could not reach a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("inconclusive, please try again: {0}")]
    TryAgain(String),
    #[error("i/o timeout")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout,
            io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused,
            _ => ProbeError::Other(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProbeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProbeError::Timeout
    }
}

pub type ProbeOutcome = Result<Verdict, ProbeError>;

/// Performs one vulnerability check against a target.
///
/// Implementations must be shareable across workers and must not panic on network errors;
/// every failure is reported through [`ProbeError`].
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &Target) -> ProbeOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_kinds() {
        let e = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert_eq!(ProbeError::from(e), ProbeError::Timeout);

        let e = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ProbeError::from(e), ProbeError::ConnectionRefused);

        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(ProbeError::from(e), ProbeError::Other("reset by peer".into()));
    }
}
