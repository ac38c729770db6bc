//! Join Handshake
//!
//! Drives a connecting client from raw transport connection to fully
//! synchronized participant. Stages are strictly ordered; the only legal
//! moves are one stage forward or a drop to terminal failure. Aborting at
//! any point discards all partial state; joins are never resumable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::seed::SyncMode;

use super::error::SyncError;
use super::protocol::JoinRequest;

/// Join attempts before giving up, the initial one included.
pub const DEFAULT_MAX_JOIN_ATTEMPTS: u32 = 3;

/// Stages of the join handshake, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStage {
    /// Transport-level connect in progress.
    Connecting,
    /// Revision, password and sync-mode exchange.
    Authorizing,
    /// Accepted, queued behind other joiners. No byte transfer.
    Waiting,
    /// Bulk snapshot download.
    Downloading,
    /// Applying the downloaded snapshot locally.
    Processing,
    /// Announcing identity; the server assigns the numeric id here.
    Registering,
    /// Receiving the paginated company roster.
    GettingCompanyInfo,
    /// Steady state; the frame clock and desync detector have taken over.
    Active,
    /// Terminal failure; the connection is torn down.
    Failed,
}

impl JoinStage {
    /// The single stage that legally follows this one.
    pub fn next(self) -> Option<JoinStage> {
        match self {
            JoinStage::Connecting => Some(JoinStage::Authorizing),
            JoinStage::Authorizing => Some(JoinStage::Waiting),
            JoinStage::Waiting => Some(JoinStage::Downloading),
            JoinStage::Downloading => Some(JoinStage::Processing),
            JoinStage::Processing => Some(JoinStage::Registering),
            JoinStage::Registering => Some(JoinStage::GettingCompanyInfo),
            JoinStage::GettingCompanyInfo => Some(JoinStage::Active),
            JoinStage::Active | JoinStage::Failed => None,
        }
    }
}

/// Why the server refused a join. Sent on the wire and surfaced as an
/// authorization error on the client.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JoinRefusal {
    /// Revision tags differ. Always fatal; there is no compatibility
    /// fallback between revisions.
    #[error("revision mismatch: server runs {server}")]
    WrongRevision {
        /// The server's revision tag.
        server: String,
    },

    /// Password missing or wrong.
    #[error("wrong password")]
    WrongPassword,

    /// The requested seed-exchange mode is not the one this server runs.
    #[error("sync mode rejected; server requires double_seed={}, every_frame={}",
            required.double_seed, required.every_frame)]
    SyncModeRejected {
        /// Mode the server requires.
        required: SyncMode,
    },

    /// This address or unique id is banned.
    #[error("banned from this server")]
    Banned,

    /// No free client slot.
    #[error("server is full")]
    ServerFull,
}

/// Server-side authorization policy.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Revision tag clients must match verbatim.
    pub revision: String,
    /// Game password; empty disables the check.
    pub password: String,
    /// The seed-exchange mode this server runs.
    pub sync_mode: SyncMode,
}

impl AuthPolicy {
    /// Check a join request against this policy.
    ///
    /// The sync mode is negotiated here rather than configured per side:
    /// a client asking for a different mode is refused outright, so the
    /// two ends can never end up sampling on different cadences.
    pub fn authorize(&self, request: &JoinRequest) -> Result<(), JoinRefusal> {
        if request.revision != self.revision {
            return Err(JoinRefusal::WrongRevision {
                server: self.revision.clone(),
            });
        }
        if !self.password.is_empty() && request.password.as_deref() != Some(&self.password) {
            return Err(JoinRefusal::WrongPassword);
        }
        if request.sync_mode != self.sync_mode {
            return Err(JoinRefusal::SyncModeRejected {
                required: self.sync_mode,
            });
        }
        Ok(())
    }
}

/// Download progress, exposed for the join-status display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinProgress {
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Bytes the server announced.
    pub bytes_expected: u64,
}

/// The client-side handshake state machine.
#[derive(Debug, Clone)]
pub struct JoinHandshake {
    stage: JoinStage,
    progress: JoinProgress,
    attempts: u32,
    max_attempts: u32,
}

impl JoinHandshake {
    /// Fresh handshake in `Connecting`, counting this as attempt one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            stage: JoinStage::Connecting,
            progress: JoinProgress::default(),
            attempts: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> JoinStage {
        self.stage
    }

    /// Download progress counters.
    pub fn progress(&self) -> JoinProgress {
        self.progress
    }

    /// Attempts used so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advance exactly one stage forward.
    ///
    /// Any non-adjacent request is rejected without changing state; the
    /// transition table is the single authority on ordering.
    pub fn advance(&mut self, to: JoinStage) -> Result<(), SyncError> {
        if self.stage.next() == Some(to) {
            self.stage = to;
            Ok(())
        } else {
            Err(SyncError::Handshake { from: self.stage, to })
        }
    }

    /// Record the announced snapshot size at the start of `Downloading`.
    pub fn begin_download(&mut self, total_bytes: u64) {
        self.progress = JoinProgress {
            bytes_received: 0,
            bytes_expected: total_bytes,
        };
    }

    /// Account for a received chunk.
    ///
    /// More bytes than announced means the stream is corrupt, not merely
    /// truncated, so that is fatal rather than retryable.
    pub fn receive_bytes(&mut self, len: u64) -> Result<(), SyncError> {
        let received = self.progress.bytes_received + len;
        if received > self.progress.bytes_expected {
            return Err(SyncError::StateCorruption(format!(
                "download overran announced size: {received} > {}",
                self.progress.bytes_expected
            )));
        }
        self.progress.bytes_received = received;
        Ok(())
    }

    /// Check the transfer completed, classifying truncation.
    pub fn finish_download(&self) -> Result<(), SyncError> {
        if self.progress.bytes_received == self.progress.bytes_expected {
            Ok(())
        } else {
            Err(SyncError::Transfer {
                received: self.progress.bytes_received,
                expected: self.progress.bytes_expected,
            })
        }
    }

    /// Mark the handshake terminally failed.
    pub fn fail(&mut self) {
        self.stage = JoinStage::Failed;
        self.progress = JoinProgress::default();
    }

    /// Attempt a fresh join after a retryable error.
    ///
    /// Resets the whole machine back to `Connecting` with zeroed
    /// counters. Returns `false` when the attempt budget is exhausted or
    /// the error is not retryable; the handshake then stays `Failed`.
    pub fn retry(&mut self, error: &SyncError) -> bool {
        if !error.is_retryable() || self.attempts >= self.max_attempts {
            self.fail();
            return false;
        }
        self.attempts += 1;
        self.stage = JoinStage::Connecting;
        self.progress = JoinProgress::default();
        true
    }
}

impl Default for JoinHandshake {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOIN_ATTEMPTS)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: [JoinStage; 8] = [
        JoinStage::Connecting,
        JoinStage::Authorizing,
        JoinStage::Waiting,
        JoinStage::Downloading,
        JoinStage::Processing,
        JoinStage::Registering,
        JoinStage::GettingCompanyInfo,
        JoinStage::Active,
    ];

    fn request(revision: &str, password: Option<&str>, sync_mode: SyncMode) -> JoinRequest {
        JoinRequest {
            revision: revision.into(),
            password: password.map(String::from),
            sync_mode,
        }
    }

    fn policy() -> AuthPolicy {
        AuthPolicy {
            revision: "r1234".into(),
            password: "letmein".into(),
            sync_mode: SyncMode::default(),
        }
    }

    #[test]
    fn test_full_linear_progression() {
        let mut hs = JoinHandshake::default();
        for stage in &STAGES[1..] {
            hs.advance(*stage).unwrap();
        }
        assert_eq!(hs.stage(), JoinStage::Active);
        assert!(hs.stage().next().is_none());
    }

    #[test]
    fn test_no_stage_skipping() {
        // From every stage, every non-adjacent target is rejected.
        for (i, from) in STAGES.iter().enumerate() {
            for (j, to) in STAGES.iter().enumerate() {
                let mut hs = JoinHandshake::default();
                for stage in &STAGES[1..=i] {
                    hs.advance(*stage).unwrap();
                }
                let result = hs.advance(*to);
                if j == i + 1 {
                    assert!(result.is_ok(), "{from:?} -> {to:?} should be legal");
                } else {
                    assert!(result.is_err(), "{from:?} -> {to:?} should be illegal");
                    assert_eq!(hs.stage(), *from, "failed advance must not move");
                }
            }
        }
    }

    #[test]
    fn test_no_backward_transitions() {
        let mut hs = JoinHandshake::default();
        hs.advance(JoinStage::Authorizing).unwrap();
        hs.advance(JoinStage::Waiting).unwrap();
        assert!(hs.advance(JoinStage::Authorizing).is_err());
        assert!(hs.advance(JoinStage::Connecting).is_err());
    }

    #[test]
    fn test_download_progress_and_truncation() {
        let mut hs = JoinHandshake::default();
        hs.begin_download(100_000);
        hs.receive_bytes(40_000).unwrap();
        assert_eq!(hs.progress().bytes_received, 40_000);
        assert_eq!(hs.progress().bytes_expected, 100_000);

        // Spec scenario: stream truncated at 40 000 of 100 000 units.
        let err = hs.finish_download().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transfer { received: 40_000, expected: 100_000 }
        ));

        // Retry resets bytes_received to zero.
        assert!(hs.retry(&err));
        assert_eq!(hs.stage(), JoinStage::Connecting);
        assert_eq!(hs.progress().bytes_received, 0);
    }

    #[test]
    fn test_download_overrun_is_corruption() {
        let mut hs = JoinHandshake::default();
        hs.begin_download(10);
        let err = hs.receive_bytes(11).unwrap_err();
        assert!(matches!(err, SyncError::StateCorruption(_)));
    }

    #[test]
    fn test_retry_budget_bounded() {
        let mut hs = JoinHandshake::new(2);
        let err = SyncError::Connection("refused".into());
        assert!(hs.retry(&err));
        assert_eq!(hs.attempts(), 2);
        assert!(!hs.retry(&err));
        assert_eq!(hs.stage(), JoinStage::Failed);
    }

    #[test]
    fn test_fatal_errors_never_retry() {
        let mut hs = JoinHandshake::default();
        let err = SyncError::Auth(JoinRefusal::WrongPassword);
        assert!(!hs.retry(&err));
        assert_eq!(hs.stage(), JoinStage::Failed);
    }

    #[test]
    fn test_authorize_revision_verbatim() {
        let policy = policy();
        assert!(policy
            .authorize(&request("r1234", Some("letmein"), SyncMode::default()))
            .is_ok());

        // "r1234 " is not "r1234"; comparison is verbatim, no semantics.
        let err = policy
            .authorize(&request("r1234 ", Some("letmein"), SyncMode::default()))
            .unwrap_err();
        assert!(matches!(err, JoinRefusal::WrongRevision { .. }));
    }

    #[test]
    fn test_authorize_password() {
        let policy = policy();
        assert_eq!(
            policy.authorize(&request("r1234", None, SyncMode::default())),
            Err(JoinRefusal::WrongPassword)
        );
        assert_eq!(
            policy.authorize(&request("r1234", Some("wrong"), SyncMode::default())),
            Err(JoinRefusal::WrongPassword)
        );
    }

    #[test]
    fn test_sync_mode_mismatch_is_explicit() {
        let policy = policy();
        let asked = SyncMode { double_seed: false, every_frame: false };
        let err = policy
            .authorize(&request("r1234", Some("letmein"), asked))
            .unwrap_err();
        assert_eq!(
            err,
            JoinRefusal::SyncModeRejected { required: SyncMode::default() }
        );
    }
}
