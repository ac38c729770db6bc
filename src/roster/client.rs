//! Client records.

use serde::{Deserialize, Serialize};

use super::{ClientId, CompanyId, GameDate};

/// Language announced by a client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// No preference.
    #[default]
    Any,
    /// English.
    English,
    /// German.
    German,
    /// French.
    French,
}

/// A connected client as replicated to every other client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Numeric id, unique among currently-connected clients and stable
    /// for the lifetime of the connection. Assigned by the server during
    /// registration.
    pub id: ClientId,
    /// Display name.
    pub name: String,
    /// Announced language.
    pub language: Language,
    /// Company this client plays as; `None` while spectating.
    pub plays_as: Option<CompanyId>,
    /// Network address, kept so the client can be banned.
    pub address: String,
    /// In-simulation date the client joined.
    pub join_date: GameDate,
    /// Client-generated identifier, stable across reconnects; used to
    /// re-identify a player after a drop or for ban matching.
    pub unique_id: String,
}

impl ClientRecord {
    /// Whether this client is spectating.
    pub fn is_spectator(&self) -> bool {
        self.plays_as.is_none()
    }
}
