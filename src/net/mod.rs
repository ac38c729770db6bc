//! Network Layer
//!
//! Everything non-deterministic lives here: the wire protocol, the join
//! handshake, both session endpoints, the WebSocket plumbing and the
//! discovery collaborator. Simulation determinism is the business of
//! `core/` and `sync/`; this layer only carries their messages.

pub mod client;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{run_client, ClientConfig, ClientSession};
pub use discovery::{query_server, BanList, HostList, ServerListEntry};
pub use error::{CapacityExceeded, JoinFailure, SyncError};
pub use handshake::{AuthPolicy, JoinHandshake, JoinProgress, JoinRefusal, JoinStage};
pub use protocol::{ClientMessage, MapSnapshot, ServerMessage};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{ConnId, Outbound, ServerSession, SessionConfig};

// =============================================================================
// END-TO-END TESTS
// =============================================================================
