//! Synchronization state machines.
//!
//! Pure state, no I/O: the frame clock paces client simulation against the
//! server's authoritative counter, and the seed detector proves (or
//! disproves) that independently running simulations are still identical.
//!
//! ## Module Structure
//!
//! - `frame`: server frame counter, client advance ceiling, stall handling
//! - `seed`: seed-pair sampling cadence, bounded sample ring, comparison

pub mod frame;
pub mod seed;

pub use frame::{CeilingGrant, ClientFrameClock, Frame, ServerFrameClock, TickOutcome};
pub use seed::{DesyncDetected, DesyncDetector, SeedCheckOutcome, SeedPair, SeedSampler, SyncMode};
