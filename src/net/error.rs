//! Error taxonomy.
//!
//! Connection and transfer failures are retryable by a full re-join;
//! everything else is fatal. A desync in particular is never retried in
//! place: simulation integrity cannot be locally repaired, so the client
//! disconnects and may re-join through a fresh handshake.

use thiserror::Error;

use crate::roster::RosterError;
use crate::sync::frame::FrameOrderViolation;
use crate::sync::seed::DesyncDetected;

use super::handshake::{JoinRefusal, JoinStage};

/// A bounded container refused an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} capacity of {capacity} exceeded")]
pub struct CapacityExceeded {
    /// Which container refused.
    pub kind: &'static str,
    /// Its configured capacity.
    pub capacity: usize,
}

/// All the ways synchronization can fail.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure. Retryable by a full re-join.
    #[error("connection error: {0}")]
    Connection(String),

    /// Authorization refused. Not retryable without corrected
    /// credentials or a matching revision.
    #[error("authorization failed: {0}")]
    Auth(#[from] JoinRefusal),

    /// Bulk state transfer truncated or timed out. Retryable up to the
    /// configured attempt count.
    #[error("transfer failed: received {received} of {expected} bytes")]
    Transfer {
        /// Bytes received before the failure.
        received: u64,
        /// Bytes the server announced.
        expected: u64,
    },

    /// Downloaded snapshot is structurally invalid. Fatal; nothing is
    /// partially applied.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// Server and client simulations diverged. Fatal.
    #[error(transparent)]
    Desync(#[from] DesyncDetected),

    /// A frame message violated ordering guarantees. Treated like a
    /// desync: the connection terminates.
    #[error(transparent)]
    FrameOrder(#[from] FrameOrderViolation),

    /// A message arrived that is not legal in the current join stage.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Attempted a non-adjacent join-stage transition.
    #[error("illegal join transition {from:?} -> {to:?}")]
    Handshake {
        /// Stage the handshake was in.
        from: JoinStage,
        /// Stage that was requested.
        to: JoinStage,
    },

    /// A bounded list refused an insertion.
    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),

    /// Roster table refused a mutation.
    #[error(transparent)]
    Roster(#[from] RosterError),
}

impl SyncError {
    /// Whether a fresh join attempt may fix this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Transfer { .. })
    }
}

/// A join attempt failed, tagged with the stage it failed in.
#[derive(Debug, Error)]
#[error("join failed during {stage:?}: {source}")]
pub struct JoinFailure {
    /// Stage the handshake was in when it failed.
    pub stage: JoinStage,
    /// The underlying error.
    #[source]
    pub source: SyncError,
}

impl JoinFailure {
    /// Tag an error with the stage it occurred in.
    pub fn at(stage: JoinStage, source: SyncError) -> Self {
        Self { stage, source }
    }

    /// Whether a fresh join attempt may fix this.
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_split() {
        assert!(SyncError::Connection("refused".into()).is_retryable());
        assert!(SyncError::Transfer { received: 40_000, expected: 100_000 }.is_retryable());

        assert!(!SyncError::Auth(JoinRefusal::WrongPassword).is_retryable());
        assert!(!SyncError::StateCorruption("bad digest".into()).is_retryable());
        assert!(!SyncError::Desync(DesyncDetected {
            frame: 500,
            local: crate::sync::seed::SeedPair { seed_1: 1, seed_2: 2 },
            remote_seed_1: 3,
            remote_seed_2: Some(4),
        })
        .is_retryable());
    }

    #[test]
    fn test_join_failure_carries_stage() {
        let failure = JoinFailure::at(
            JoinStage::Downloading,
            SyncError::Transfer { received: 0, expected: 10 },
        );
        assert_eq!(failure.stage, JoinStage::Downloading);
        assert!(failure.is_retryable());
        assert!(failure.to_string().contains("Downloading"));
    }
}
