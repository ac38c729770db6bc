//! Server Discovery
//!
//! Client-side collaborators for finding and remembering servers: the
//! saved-host list, the host-ban table and a one-shot info query. Both
//! lists are capacity-bounded; insertion past capacity is an explicit
//! error so persistence formats stay fixed-size.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::roster::GameInfoSnapshot;

use super::error::CapacityExceeded;
use super::protocol::{ClientMessage, ServerMessage};

/// A bounded, duplicate-free list of address strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoundedList {
    entries: Vec<String>,
    capacity: usize,
}

impl BoundedList {
    fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity }
    }

    fn add(&mut self, entry: String, kind: &'static str) -> Result<(), CapacityExceeded> {
        if self.entries.iter().any(|e| *e == entry) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(CapacityExceeded { kind, capacity: self.capacity });
        }
        self.entries.push(entry);
        Ok(())
    }

    fn remove(&mut self, entry: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != entry);
        self.entries.len() != before
    }

    fn contains(&self, entry: &str) -> bool {
        self.entries.iter().any(|e| e == entry)
    }
}

/// Manually saved server addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostList {
    list: BoundedList,
}

impl HostList {
    /// Empty list at the default capacity.
    pub fn new() -> Self {
        Self { list: BoundedList::new(crate::MAX_SAVED_HOSTS) }
    }

    /// Save a host. Re-adding a saved host is a no-op.
    pub fn add(&mut self, host: impl Into<String>) -> Result<(), CapacityExceeded> {
        self.list.add(host.into(), "saved host")
    }

    /// Forget a host.
    pub fn remove(&mut self, host: &str) -> bool {
        self.list.remove(host)
    }

    /// Saved hosts, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.list.entries.iter().map(String::as_str)
    }

    /// Number of saved hosts.
    pub fn len(&self) -> usize {
        self.list.entries.len()
    }

    /// Whether no hosts are saved.
    pub fn is_empty(&self) -> bool {
        self.list.entries.is_empty()
    }
}

impl Default for HostList {
    fn default() -> Self {
        Self::new()
    }
}

/// Banned addresses, consulted by the server during join screening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanList {
    list: BoundedList,
}

impl BanList {
    /// Empty table at the default capacity.
    pub fn new() -> Self {
        Self { list: BoundedList::new(crate::MAX_BANS) }
    }

    /// Ban an address. Banning an already-banned address is a no-op.
    pub fn ban(&mut self, address: impl Into<String>) -> Result<(), CapacityExceeded> {
        self.list.add(address.into(), "ban")
    }

    /// Lift a ban.
    pub fn unban(&mut self, address: &str) -> bool {
        self.list.remove(address)
    }

    /// Whether an address is banned.
    pub fn is_banned(&self, address: &str) -> bool {
        self.list.contains(address)
    }

    /// Banned addresses.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.list.entries.iter().map(String::as_str)
    }

    /// Number of bans.
    pub fn len(&self) -> usize {
        self.list.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.list.entries.is_empty()
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of the server browser.
#[derive(Debug, Clone)]
pub struct ServerListEntry {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Whether the last query got an answer.
    pub online: bool,
    /// Saved by hand rather than discovered.
    pub manually_added: bool,
    /// Last known snapshot, if the server ever answered.
    pub info: Option<GameInfoSnapshot>,
}

impl ServerListEntry {
    /// Entry that has not been queried yet.
    pub fn unqueried(host: impl Into<String>, port: u16, manually_added: bool) -> Self {
        Self {
            host: host.into(),
            port,
            online: false,
            manually_added,
            info: None,
        }
    }
}

/// Query one server for its info snapshot.
///
/// Never fails: a server that cannot be reached or does not answer within
/// `timeout` simply comes back as an offline entry.
pub async fn query_server(host: &str, port: u16, timeout: Duration) -> ServerListEntry {
    let mut entry = ServerListEntry::unqueried(host, port, false);
    let url = format!("ws://{host}:{port}");

    let ws_stream = match tokio::time::timeout(timeout, connect_async(&url)).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            debug!(%url, %e, "query connect failed");
            return entry;
        }
        Err(_) => {
            debug!(%url, "query connect timed out");
            return entry;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let query = ClientMessage::Query { want_full: true };
    let Ok(text) = query.to_json() else {
        return entry;
    };
    if ws_sender.send(Message::Text(text)).await.is_err() {
        return entry;
    }

    while let Ok(Some(Ok(msg))) = tokio::time::timeout(timeout, ws_receiver.next()).await {
        if let Message::Text(text) = msg {
            if let Ok(ServerMessage::GameInfo { info }) = ServerMessage::from_json(&text) {
                entry.online = true;
                entry.info = Some(info);
                break;
            }
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;
    entry
}

// =============================================================================
// TESTS
// =============================================================================
