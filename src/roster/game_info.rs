//! Game info snapshot.
//!
//! The immutable-per-update record describing server identity, map and
//! capacity. The server recomputes it whenever roster membership or map
//! state changes; discovery queries and the join handshake read it,
//! clients never mutate it.

use serde::{Deserialize, Serialize};

use super::{GameDate, Language, RosterConfig, RosterTables};

/// Static identity of a server, configured once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Advertised server name.
    pub name: String,
    /// Hostname, if any.
    pub hostname: String,
    /// Build revision tag, compared verbatim for compatibility.
    pub revision: String,
    /// Server language.
    pub language: Language,
    /// Game password; empty disables password protection.
    pub password: String,
    /// Whether this is a dedicated server without a local player.
    pub dedicated: bool,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: "Unnamed Server".into(),
            hostname: String::new(),
            revision: crate::NO_REVISION.into(),
            language: Language::Any,
            password: String::new(),
            dedicated: true,
        }
    }
}

/// Map descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapInfo {
    /// Map name; "random" for a generated map.
    pub name: String,
    /// Width in tiles.
    pub width: u16,
    /// Height in tiles.
    pub height: u16,
    /// Landscape variant.
    pub variant: u8,
}

impl Default for MapInfo {
    fn default() -> Self {
        Self {
            name: "random".into(),
            width: 256,
            height: 256,
            variant: 0,
        }
    }
}

/// Snapshot of server identity, map and occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameInfoSnapshot {
    /// Server name.
    pub server_name: String,
    /// Server hostname.
    pub hostname: String,
    /// Revision tag, compared verbatim.
    pub revision: String,
    /// Server language.
    pub language: Language,
    /// Whether a password is required to join.
    pub use_password: bool,
    /// Maximum clients.
    pub clients_max: u8,
    /// Currently connected clients.
    pub clients_on: u8,
    /// Maximum spectators.
    pub spectators_max: u8,
    /// Currently connected spectators.
    pub spectators_on: u8,
    /// Current in-simulation date.
    pub game_date: GameDate,
    /// In-simulation date the game started.
    pub start_date: GameDate,
    /// Map name.
    pub map_name: String,
    /// Map width in tiles.
    pub map_width: u16,
    /// Map height in tiles.
    pub map_height: u16,
    /// Landscape variant.
    pub map_variant: u8,
    /// Dedicated-server flag.
    pub dedicated: bool,
}

impl GameInfoSnapshot {
    /// Build the snapshot from current server state.
    ///
    /// Occupancy is read from the roster, which enforces its capacities
    /// at insertion time, so `clients_on <= clients_max` holds by
    /// construction.
    pub fn build(
        identity: &ServerIdentity,
        map: &MapInfo,
        roster: &RosterTables,
        config: &RosterConfig,
        game_date: GameDate,
        start_date: GameDate,
    ) -> Self {
        Self {
            server_name: identity.name.clone(),
            hostname: identity.hostname.clone(),
            revision: identity.revision.clone(),
            language: identity.language,
            use_password: !identity.password.is_empty(),
            clients_max: config.max_clients.min(u8::MAX as usize) as u8,
            clients_on: roster.client_count().min(u8::MAX as usize) as u8,
            spectators_max: config.max_spectators.min(u8::MAX as usize) as u8,
            spectators_on: roster.spectator_count().min(u8::MAX as usize) as u8,
            game_date,
            start_date,
            map_name: map.name.clone(),
            map_width: map.width,
            map_height: map.height,
            map_variant: map.variant,
            dedicated: identity.dedicated,
        }
    }

    /// Whether another client can join (ignoring spectator slots).
    pub fn has_room(&self) -> bool {
        self.clients_on < self.clients_max
    }
}
