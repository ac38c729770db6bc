//! Game Log
//!
//! Bounded record of events that change what the simulation computes:
//! the revision the session started under, revision and setting changes,
//! membership churn and company removals. The log replicates inside the
//! map snapshot so every participant holds the same history, and it is
//! dumped when a desync is detected; these changes are the usual suspects
//! behind one.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sync::frame::Frame;

use super::{ClientId, CompanyId};

/// Entries retained; the oldest is evicted past this.
pub const GAME_LOG_CAPACITY: usize = 64;

/// A loggable simulation-affecting change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameLogEvent {
    /// The session started under this build revision.
    Started {
        /// Revision tag of the hosting build.
        revision: String,
    },
    /// The hosting build changed between sessions of the same game.
    RevisionChanged {
        /// Revision the game last ran under.
        from: String,
        /// Revision it runs under now.
        to: String,
    },
    /// A simulation-affecting setting changed value.
    SettingChanged {
        /// Setting name.
        name: String,
        /// Previous value.
        old: String,
        /// New value.
        new: String,
    },
    /// A client joined the roster.
    ClientJoined {
        /// Assigned roster id.
        client_id: ClientId,
        /// Display name at join time.
        name: String,
    },
    /// A client left the roster.
    ClientLeft {
        /// The departed client.
        client_id: ClientId,
    },
    /// A company was liquidated or auto-cleaned.
    CompanyRemoved {
        /// The removed company.
        company_id: CompanyId,
    },
}

impl fmt::Display for GameLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameLogEvent::Started { revision } => write!(f, "started under {revision}"),
            GameLogEvent::RevisionChanged { from, to } => {
                write!(f, "revision changed {from} -> {to}")
            }
            GameLogEvent::SettingChanged { name, old, new } => {
                write!(f, "setting {name} changed {old} -> {new}")
            }
            GameLogEvent::ClientJoined { client_id, name } => {
                write!(f, "client {client_id} ({name}) joined")
            }
            GameLogEvent::ClientLeft { client_id } => write!(f, "client {client_id} left"),
            GameLogEvent::CompanyRemoved { company_id } => {
                write!(f, "company {company_id} removed")
            }
        }
    }
}

/// One logged change, stamped with the frame it happened at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLogEntry {
    /// Frame the change took effect.
    pub frame: Frame,
    /// What changed.
    pub event: GameLogEvent,
}

/// The bounded game log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    entries: VecDeque<GameLogEntry>,
}

impl GameLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest at capacity.
    pub fn record(&mut self, frame: Frame, event: GameLogEvent) {
        if self.entries.len() == GAME_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(GameLogEntry { frame, event });
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &GameLogEntry> {
        self.entries.iter()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every entry to the log output.
    ///
    /// Called when a desync is reported, so the changes leading up to it
    /// are on record next to the mismatch itself.
    pub fn dump(&self) {
        info!(entries = self.entries.len(), "game log");
        for entry in &self.entries {
            info!(frame = entry.frame, "  {}", entry.event);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let mut log = GameLog::new();
        log.record(0, GameLogEvent::Started { revision: "r1".into() });
        log.record(
            500,
            GameLogEvent::SettingChanged {
                name: "pause_on_join".into(),
                old: "off".into(),
                new: "on".into(),
            },
        );
        log.record(600, GameLogEvent::ClientJoined { client_id: 2, name: "bob".into() });

        let frames: Vec<Frame> = log.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![0, 500, 600]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = GameLog::new();
        for id in 0..(GAME_LOG_CAPACITY as u32 + 10) {
            log.record(id, GameLogEvent::ClientLeft { client_id: id });
        }
        assert_eq!(log.len(), GAME_LOG_CAPACITY);
        // Entries 0..10 are gone, the newest survive.
        assert_eq!(log.iter().next().unwrap().frame, 10);
        assert_eq!(log.iter().last().unwrap().frame, GAME_LOG_CAPACITY as u32 + 9);
    }

    #[test]
    fn test_event_rendering() {
        let event = GameLogEvent::RevisionChanged { from: "r1".into(), to: "r2".into() };
        assert_eq!(event.to_string(), "revision changed r1 -> r2");
        let event = GameLogEvent::ClientJoined { client_id: 3, name: "alice".into() };
        assert_eq!(event.to_string(), "client 3 (alice) joined");
    }
}
