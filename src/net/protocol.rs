//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Control messages are serialized as JSON for debugging ease; the bulk
//! map snapshot travels as bincode inside chunked binary frames.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::roster::{
    ClientId, CompanyId, CompanyRecord, ClientRecord, GameInfoSnapshot, GameLog, Language,
    RosterTables,
};
use crate::sync::frame::{CeilingGrant, Frame};
use crate::sync::seed::SyncMode;

use super::error::SyncError;
use super::handshake::JoinRefusal;

/// Bytes per map chunk frame.
pub const MAP_CHUNK_SIZE: usize = 4096;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open the join handshake: credentials and sync-mode negotiation.
    Join(JoinRequest),

    /// Announce identity after the snapshot is applied, so the server
    /// can add this client to the roster and assign its numeric id.
    Register(RegisterRequest),

    /// Acknowledge simulation progress up to a frame.
    FrameAck {
        /// Highest frame the client has simulated.
        frame: Frame,
    },

    /// Password-gated console command pass-through.
    Rcon {
        /// RCON password.
        password: String,
        /// Command string; semantics are the embedder's business.
        command: String,
    },

    /// Discovery query; no join intended.
    Query {
        /// Request the full snapshot rather than just name and occupancy.
        want_full: bool,
    },

    /// Orderly disconnect or join abort.
    Quit,
}

/// Authorization payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Build revision tag, compared verbatim against the server's.
    pub revision: String,
    /// Game password, if the server requires one.
    pub password: Option<String>,
    /// Requested seed-exchange mode. The server either runs this exact
    /// mode or refuses the join; mismatched modes never silently no-op.
    pub sync_mode: SyncMode,
}

/// Registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Display name.
    pub name: String,
    /// Client-generated unique identifier for re-identification.
    pub unique_id: String,
    /// Announced language.
    pub language: Language,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authorization passed; server shares its pacing parameters.
    JoinAccepted {
        /// Effective seed-exchange mode (always the requested one).
        sync_mode: SyncMode,
        /// Frames between ceiling grants.
        frame_frequency: u32,
        /// Base frames between seed comparisons.
        sync_frequency: u32,
    },

    /// Authorization refused. Terminal for this attempt.
    JoinRefused(JoinRefusal),

    /// Client is queued behind other joiners; no bytes flow yet.
    Wait {
        /// Clients ahead of this one, the transfer in progress included.
        clients_ahead: u8,
    },

    /// Bulk snapshot transfer is starting.
    MapBegin {
        /// Frame the snapshot was taken at; the client resumes here.
        frame: Frame,
        /// Total snapshot size in bytes.
        total_bytes: u64,
    },

    /// One chunk of the snapshot.
    MapChunk {
        /// Raw snapshot bytes.
        data: Vec<u8>,
    },

    /// Snapshot transfer complete.
    MapDone,

    /// Registration accepted; the numeric id is now assigned.
    Welcome {
        /// This client's id.
        client_id: ClientId,
    },

    /// Replication: a client record changed or appeared.
    ClientInfoUpdate {
        /// The new record.
        record: ClientRecord,
    },

    /// Replication: a client left; its records are already gone.
    ClientQuit {
        /// The departed client.
        client_id: ClientId,
    },

    /// Replication: one company roster row.
    CompanyInfoUpdate {
        /// Company id.
        company_id: CompanyId,
        /// The record, password stripped.
        record: CompanyRecord,
    },

    /// Replication: a company was liquidated or cleaned up.
    CompanyDelete {
        /// The removed company.
        company_id: CompanyId,
    },

    /// End of the paginated company sync; the client goes active.
    CompanyInfoEnd,

    /// Steady state: a new ceiling grant.
    FrameUpdate(CeilingGrant),

    /// Steady state: the server's seed sample for a frame.
    SeedCheck {
        /// Frame both sides sample at.
        frame: Frame,
        /// First accumulator.
        seed_1: u32,
        /// Second accumulator; absent in single-seed mode.
        seed_2: Option<u32>,
    },

    /// RCON command output.
    RconResponse {
        /// Response text.
        output: String,
    },

    /// Server-side termination with a reason.
    Kicked {
        /// Human-readable reason.
        reason: String,
    },

    /// Discovery reply with the current snapshot.
    GameInfo {
        /// The server's current snapshot.
        info: GameInfoSnapshot,
    },

    /// Server is shutting down.
    Shutdown,
}

// =============================================================================
// MAP SNAPSHOT
// =============================================================================

/// The full simulation state handed to a joining client.
///
/// Carries the frame it was taken at, the PRNG state to resume the random
/// stream mid-sequence, the replicated roster and the game log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSnapshot {
    /// Frame the snapshot was taken at.
    pub frame: Frame,
    /// Simulation PRNG state words.
    pub rng_state: [u32; 2],
    /// Roster replica, passwords stripped.
    pub roster: RosterTables,
    /// Log of simulation-affecting changes up to the snapshot frame.
    pub log: GameLog,
}

#[derive(Serialize, Deserialize)]
struct MapTransfer {
    payload: Vec<u8>,
    digest: [u8; 32],
}

impl MapSnapshot {
    /// Serialize with an integrity digest.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let payload = bincode::serialize(self)
            .map_err(|e| SyncError::StateCorruption(format!("snapshot encode: {e}")))?;
        let digest = snapshot_digest(&payload);
        bincode::serialize(&MapTransfer { payload, digest })
            .map_err(|e| SyncError::StateCorruption(format!("snapshot encode: {e}")))
    }

    /// Deserialize and verify the integrity digest.
    ///
    /// Any structural damage, a digest mismatch included, is fatal: the
    /// snapshot is discarded whole, never partially applied.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let transfer: MapTransfer = bincode::deserialize(bytes)
            .map_err(|e| SyncError::StateCorruption(format!("snapshot frame: {e}")))?;
        if snapshot_digest(&transfer.payload) != transfer.digest {
            return Err(SyncError::StateCorruption("snapshot digest mismatch".into()));
        }
        let snapshot: MapSnapshot = bincode::deserialize(&transfer.payload)
            .map_err(|e| SyncError::StateCorruption(format!("snapshot payload: {e}")))?;
        snapshot.roster.validate()?;
        Ok(snapshot)
    }
}

fn snapshot_digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lockstep-map-v1");
    hasher.update(payload);
    hasher.finalize().into()
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::SimulationRng;
    use crate::roster::RosterConfig;

    #[test]
    fn test_client_message_json_roundtrip() {
        let msg = ClientMessage::Join(JoinRequest {
            revision: "r1234".into(),
            password: Some("secret".into()),
            sync_mode: SyncMode::default(),
        });

        let json = msg.to_json().unwrap();
        let parsed = ClientMessage::from_json(&json).unwrap();

        if let ClientMessage::Join(req) = parsed {
            assert_eq!(req.revision, "r1234");
            assert_eq!(req.password.as_deref(), Some("secret"));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_server_message_json_roundtrip() {
        let msg = ServerMessage::SeedCheck {
            frame: 500,
            seed_1: 0xDEADBEEF,
            seed_2: None,
        };

        let json = msg.to_json().unwrap();
        let parsed = ServerMessage::from_json(&json).unwrap();

        if let ServerMessage::SeedCheck { frame, seed_1, seed_2 } = parsed {
            assert_eq!(frame, 500);
            assert_eq!(seed_1, 0xDEADBEEF);
            assert_eq!(seed_2, None);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_frame_update_roundtrip() {
        let msg = ServerMessage::FrameUpdate(CeilingGrant { frame: 1000, ceiling: 1010 });
        let json = msg.to_json().unwrap();
        assert!(json.contains("frame_update"));
        let _ = ServerMessage::from_json(&json).unwrap();
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let rng = SimulationRng::new(77);
        let mut roster = RosterTables::new();
        roster
            .found_company(
                crate::roster::CompanyRecord::new("Acme", 1950),
                &RosterConfig::default(),
            )
            .unwrap();

        let mut log = GameLog::new();
        log.record(0, crate::roster::GameLogEvent::Started { revision: "r1".into() });
        let snapshot = MapSnapshot {
            frame: 4200,
            rng_state: rng.state(),
            roster,
            log,
        };

        let bytes = snapshot.encode().unwrap();
        let decoded = MapSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.frame, 4200);
        assert_eq!(decoded.rng_state, rng.state());
        assert_eq!(decoded.roster.company_count(), 1);
        assert_eq!(decoded.log.len(), 1);
    }

    #[test]
    fn test_corrupted_snapshot_rejected() {
        let snapshot = MapSnapshot {
            frame: 1,
            rng_state: [1, 2],
            roster: RosterTables::new(),
            log: GameLog::new(),
        };
        let mut bytes = snapshot.encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;

        let err = MapSnapshot::decode(&bytes).unwrap_err();
        assert!(matches!(err, SyncError::StateCorruption(_)));
    }

    #[test]
    fn test_truncated_snapshot_rejected() {
        let snapshot = MapSnapshot {
            frame: 1,
            rng_state: [1, 2],
            roster: RosterTables::new(),
            log: GameLog::new(),
        };
        let bytes = snapshot.encode().unwrap();
        let err = MapSnapshot::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, SyncError::StateCorruption(_)));
    }
}
