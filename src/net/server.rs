//! WebSocket Game Server
//!
//! Async front-end around [`ServerSession`]: accepts WebSocket
//! connections, pumps client messages into the session machine and routes
//! its outbound batches back to the right sockets. The simulation frame
//! loop runs on a fixed wall-clock interval in the same task as the
//! accept loop, so the session never needs internal locking for ordering.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::core::rng::SimulationRng;
use crate::sync::frame::Frame;

use super::protocol::{ClientMessage, ServerMessage};
use super::session::{ConnId, Outbound, ServerSession, SessionConfig};

type SenderMap = Arc<RwLock<BTreeMap<ConnId, mpsc::Sender<ServerMessage>>>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections, joined or not.
    pub max_connections: usize,
    /// Wall-clock duration of one simulation frame.
    pub frame_interval: Duration,
    /// Simulation seed.
    pub seed: u32,
    /// The lockstep session configuration.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            max_connections: 64,
            frame_interval: Duration::from_millis(33),
            seed: 0,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from `LOCKSTEP_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("LOCKSTEP_BIND") {
            config.bind_addr = addr;
        }
        if let Some(max) = env_parse::<usize>("LOCKSTEP_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(ms) = env_parse::<u64>("LOCKSTEP_FRAME_MS") {
            config.frame_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(seed) = env_parse::<u32>("LOCKSTEP_SEED") {
            config.seed = seed;
        }
        if let Ok(name) = std::env::var("LOCKSTEP_SERVER_NAME") {
            config.session.identity.name = name;
        }
        if let Ok(revision) = std::env::var("LOCKSTEP_REVISION") {
            config.session.identity.revision = revision;
        }
        if let Ok(password) = std::env::var("LOCKSTEP_PASSWORD") {
            config.session.identity.password = password;
        }
        if let Ok(password) = std::env::var("LOCKSTEP_RCON_PASSWORD") {
            config.session.rcon_password = password;
        }
        if let Some(max) = env_parse::<usize>("LOCKSTEP_MAX_CLIENTS") {
            config.session.roster.max_clients = max;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to the configured address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The lockstep game server.
pub struct GameServer {
    config: ServerConfig,
    session: Arc<Mutex<ServerSession>>,
    senders: SenderMap,
    next_conn: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server; nothing runs until [`run`](GameServer::run).
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let session = ServerSession::new(config.session.clone(), config.seed);

        Self {
            config,
            session: Arc::new(Mutex::new(session)),
            senders: Arc::new(RwLock::new(BTreeMap::new())),
            next_conn: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
        }
    }

    /// Shared handle to the session, for console handlers and inspection.
    pub fn session(&self) -> Arc<Mutex<ServerSession>> {
        self.session.clone()
    }

    /// Signal the server to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connection count.
    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Accept connections and drive the simulation until shut down.
    ///
    /// The closure is the embedder's deterministic per-frame logic; it
    /// runs once per frame against the authoritative generator.
    pub async fn run(
        &self,
        mut sim: impl FnMut(Frame, &mut SimulationRng),
    ) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("lockstep server listening on {}", self.config.bind_addr);

        let mut ticker = interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outbound = self.session.lock().await.advance_frame(&mut sim);
                    deliver(&self.senders, outbound).await;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.senders.read().await.len() >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let outbound = self.session.lock().await.teardown();
        deliver(&self.senders, outbound).await;
        Ok(())
    }

    /// Spawn the per-connection task.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let session = self.session.clone();
        let senders = self.senders.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };
            info!(conn, %addr, "connection accepted");

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(256);

            session.lock().await.handle_connect(conn, addr.to_string());
            senders.write().await.insert(conn, msg_tx);

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!(conn, "invalid message: {}", e);
                                        continue;
                                    }
                                };

                                let result = session.lock().await.handle_message(conn, client_msg);
                                match result {
                                    Ok(outbound) => deliver(&senders, outbound).await,
                                    Err(e) => {
                                        // Protocol or ordering violations end
                                        // the connection.
                                        warn!(conn, "terminating connection: {}", e);
                                        deliver(&senders, vec![(conn, ServerMessage::Kicked {
                                            reason: e.to_string(),
                                        })]).await;
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(conn, "connection closed");
                                break;
                            }
                            Some(Err(e)) => {
                                debug!(conn, "websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            let outbound = session.lock().await.handle_disconnect(conn);
            senders.write().await.remove(&conn);
            deliver(&senders, outbound).await;
            sender_task.abort();
            info!(conn, %addr, "connection cleaned up");
        });
    }
}

/// Route an outbound batch to the owning connections.
async fn deliver(senders: &SenderMap, outbound: Outbound) {
    for (conn, msg) in outbound {
        let sender = senders.read().await.get(&conn).cloned();
        if let Some(sender) = sender {
            if sender.send(msg).await.is_err() {
                debug!(conn, "dropping message for closed connection");
            }
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
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), crate::DEFAULT_PORT);
        assert_eq!(config.session.frame_frequency, crate::DEFAULT_FRAME_FREQUENCY);
        assert_eq!(config.session.sync_frequency, crate::DEFAULT_SYNC_FREQUENCY);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(ServerConfig::default());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session().lock().await.frame(), 0);
    }

    #[tokio::test]
    async fn test_server_shutdown_signal() {
        let server = GameServer::new(ServerConfig::default());
        server.shutdown();
    }
}
