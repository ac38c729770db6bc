//! # Lockstep Synchronization Core
//!
//! Keeps one authoritative server and N clients advancing the same
//! deterministic simulation in frame-exact agreement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LOCKSTEP SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  └── rng.rs      - Simulation PRNG (seed-pair source)        │
//! │                                                              │
//! │  sync/           - Synchronization state machines            │
//! │  ├── frame.rs    - Server frame counter / client ceiling     │
//! │  └── seed.rs     - Seed-pair sampling and desync detection   │
//! │                                                              │
//! │  roster/         - Replicated participant data               │
//! │  ├── company.rs  - Company records                           │
//! │  ├── client.rs   - Client records                            │
//! │  ├── gamelog.rs  - Simulation-change log                     │
//! │  └── game_info.rs- Server/map snapshot for discovery         │
//! │                                                              │
//! │  net/            - Networking (non-deterministic)            │
//! │  ├── protocol.rs - Wire message types                        │
//! │  ├── handshake.rs- Join stage machine                        │
//! │  ├── client.rs   - Client-side session                       │
//! │  ├── session.rs  - Server-side session                       │
//! │  ├── server.rs   - WebSocket accept loop                     │
//! │  └── discovery.rs- Server query + host/ban lists             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Synchronization Model
//!
//! The server owns the authoritative frame counter. Clients run the same
//! simulation independently and may only advance up to a ceiling granted
//! by periodic `FrameUpdate` messages. At a fixed cadence both sides
//! sample two 32-bit accumulators straight from the simulation PRNG state
//! and compare them; any mismatch proves divergence and is fatal to the
//! client's connection. Correctness comes from periodic checksum
//! agreement, never from shared memory.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod net;
pub mod roster;
pub mod sync;

// Re-export commonly used types
pub use crate::core::rng::SimulationRng;
pub use net::client::ClientSession;
pub use net::error::SyncError;
pub use net::handshake::{JoinProgress, JoinStage};
pub use net::session::ServerSession;
pub use sync::frame::{ClientFrameClock, ServerFrameClock};
pub use sync::seed::{DesyncDetector, SeedPair, SyncMode};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision tag reported when no build revision is baked in.
///
/// Compatibility checks compare revision tags verbatim; this fallback only
/// matches another build using the same fallback.
pub const NO_REVISION: &str = "norev000";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3979;

/// Frames between seed-pair comparisons in the default sync mode.
pub const DEFAULT_SYNC_FREQUENCY: u32 = 100;

/// Frames between ceiling grants from the server.
pub const DEFAULT_FRAME_FREQUENCY: u32 = 10;

/// Simulation frames per in-game day.
pub const FRAMES_PER_DAY: u32 = 74;

/// Vehicle categories replicated per company record.
pub const VEHICLE_CATEGORIES: usize = 5;

/// Station categories replicated per company record.
pub const STATION_CATEGORIES: usize = 5;

/// Maximum entries in the saved-host list.
pub const MAX_SAVED_HOSTS: usize = 10;

/// Maximum entries in the ban list.
pub const MAX_BANS: usize = 25;
