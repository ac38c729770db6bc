//! Client Session
//!
//! The joining side of the lockstep protocol: a pure state machine
//! (`ClientSession`) that consumes server messages and emits replies, and
//! a thin WebSocket runner that pumps it. Keeping the machine free of I/O
//! means every stage transition and failure path is testable without a
//! socket.

use sha2::{Digest, Sha256};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::rng::SimulationRng;
use crate::roster::{ClientId, GameLog, Language, RosterTables};
use crate::sync::frame::{CeilingGrant, ClientFrameClock, Frame, TickOutcome};
use crate::sync::seed::{DesyncDetector, SyncMode};

use super::error::{JoinFailure, SyncError};
use super::handshake::{JoinHandshake, JoinProgress, JoinStage, DEFAULT_MAX_JOIN_ATTEMPTS};
use super::protocol::{ClientMessage, JoinRequest, MapSnapshot, RegisterRequest, ServerMessage};

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name.
    pub name: String,
    /// Stable identifier for re-identification across connections.
    pub unique_id: String,
    /// Announced language.
    pub language: Language,
    /// Build revision tag.
    pub revision: String,
    /// Game password, if the server requires one.
    pub password: Option<String>,
    /// Seed-exchange mode to negotiate.
    pub sync_mode: SyncMode,
    /// Join attempts before giving up.
    pub max_join_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Player".into(),
            unique_id: generate_unique_id(),
            language: Language::Any,
            revision: crate::NO_REVISION.into(),
            password: None,
            sync_mode: SyncMode::default(),
            max_join_attempts: DEFAULT_MAX_JOIN_ATTEMPTS,
        }
    }
}

/// Derive a stable-looking opaque client identifier.
///
/// Hashed so the raw UUID never appears on the wire.
pub fn generate_unique_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Parameters the server shares on a successful authorization.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    sync_mode: SyncMode,
    frame_frequency: u32,
    sync_frequency: u32,
}

/// Steady-state machinery, constructed once the join completes.
#[derive(Debug)]
struct ActiveState {
    rng: SimulationRng,
    clock: ClientFrameClock,
    detector: DesyncDetector,
}

/// The client endpoint of a lockstep session.
#[derive(Debug)]
pub struct ClientSession {
    config: ClientConfig,
    handshake: JoinHandshake,
    negotiated: Option<Negotiated>,
    map_frame: Frame,
    map_buffer: Vec<u8>,
    snapshot: Option<MapSnapshot>,
    client_id: Option<ClientId>,
    roster: RosterTables,
    log: GameLog,
    active: Option<ActiveState>,
}

impl ClientSession {
    /// New session in `Connecting`.
    pub fn new(config: ClientConfig) -> Self {
        let handshake = JoinHandshake::new(config.max_join_attempts);
        Self {
            config,
            handshake,
            negotiated: None,
            map_frame: 0,
            map_buffer: Vec::new(),
            snapshot: None,
            client_id: None,
            roster: RosterTables::new(),
            log: GameLog::new(),
            active: None,
        }
    }

    /// Current join stage.
    pub fn stage(&self) -> JoinStage {
        self.handshake.stage()
    }

    /// Download progress, for the join-status display.
    pub fn progress(&self) -> JoinProgress {
        self.handshake.progress()
    }

    /// Join attempts used so far.
    pub fn attempts(&self) -> u32 {
        self.handshake.attempts()
    }

    /// Server-assigned id, once registered.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// The replicated roster.
    pub fn roster(&self) -> &RosterTables {
        &self.roster
    }

    /// The replicated game log, for desync post-mortems.
    pub fn game_log(&self) -> &GameLog {
        &self.log
    }

    /// Local simulation frame; zero until active.
    pub fn frame(&self) -> Frame {
        self.active.as_ref().map(|a| a.clock.frame()).unwrap_or(0)
    }

    /// Frames the server is known to be ahead.
    pub fn frames_behind(&self) -> u32 {
        self.active.as_ref().map(|a| a.clock.frames_behind()).unwrap_or(0)
    }

    /// Ticks spent waiting at the ceiling.
    pub fn stalled_ticks(&self) -> u64 {
        self.active.as_ref().map(|a| a.clock.stalled_ticks()).unwrap_or(0)
    }

    /// Whether the join completed and lockstep is running.
    pub fn is_active(&self) -> bool {
        self.handshake.stage() == JoinStage::Active
    }

    /// The transport connected; open the handshake.
    pub fn connected(&mut self) -> Result<ClientMessage, SyncError> {
        self.handshake.advance(JoinStage::Authorizing)?;
        Ok(ClientMessage::Join(JoinRequest {
            revision: self.config.revision.clone(),
            password: self.config.password.clone(),
            sync_mode: self.config.sync_mode,
        }))
    }

    /// Feed one server message, producing any replies.
    pub fn apply(&mut self, message: ServerMessage) -> Result<Vec<ClientMessage>, SyncError> {
        match message {
            ServerMessage::JoinAccepted { sync_mode, frame_frequency, sync_frequency } => {
                self.expect_stage(JoinStage::Authorizing)?;
                if sync_mode != self.config.sync_mode {
                    // Negotiation means exact agreement; an "accepted" reply
                    // carrying a different mode is a protocol violation.
                    return Err(SyncError::Protocol(
                        "join accepted with a sync mode other than the requested one".into(),
                    ));
                }
                self.negotiated = Some(Negotiated {
                    sync_mode,
                    frame_frequency: frame_frequency.max(1),
                    sync_frequency: sync_frequency.max(1),
                });
                self.handshake.advance(JoinStage::Waiting)?;
                Ok(Vec::new())
            }

            ServerMessage::JoinRefused(refusal) => {
                self.handshake.fail();
                Err(SyncError::Auth(refusal))
            }

            ServerMessage::Wait { clients_ahead } => {
                self.expect_stage(JoinStage::Waiting)?;
                debug!(clients_ahead, "queued behind other joiners");
                Ok(Vec::new())
            }

            ServerMessage::MapBegin { frame, total_bytes } => {
                self.handshake.advance(JoinStage::Downloading)?;
                self.handshake.begin_download(total_bytes);
                self.map_frame = frame;
                self.map_buffer = Vec::with_capacity(total_bytes.min(1 << 24) as usize);
                Ok(Vec::new())
            }

            ServerMessage::MapChunk { data } => {
                self.expect_stage(JoinStage::Downloading)?;
                self.handshake.receive_bytes(data.len() as u64)?;
                self.map_buffer.extend_from_slice(&data);
                Ok(Vec::new())
            }

            ServerMessage::MapDone => {
                self.expect_stage(JoinStage::Downloading)?;
                self.handshake.finish_download()?;
                self.handshake.advance(JoinStage::Processing)?;

                // Decode and validate before anything is applied; a bad
                // snapshot leaves the session exactly as it was.
                let snapshot = MapSnapshot::decode(&self.map_buffer)?;
                self.map_buffer.clear();
                self.roster = snapshot.roster.clone();
                self.log = snapshot.log.clone();
                self.snapshot = Some(snapshot);

                self.handshake.advance(JoinStage::Registering)?;
                Ok(vec![ClientMessage::Register(RegisterRequest {
                    name: self.config.name.clone(),
                    unique_id: self.config.unique_id.clone(),
                    language: self.config.language,
                })])
            }

            ServerMessage::Welcome { client_id } => {
                self.expect_stage(JoinStage::Registering)?;
                self.client_id = Some(client_id);
                self.handshake.advance(JoinStage::GettingCompanyInfo)?;
                Ok(Vec::new())
            }

            ServerMessage::ClientInfoUpdate { record } => {
                self.expect_replicating()?;
                self.roster.apply_client_update(record);
                Ok(Vec::new())
            }

            ServerMessage::ClientQuit { client_id } => {
                self.expect_replicating()?;
                self.roster.remove_client(client_id);
                Ok(Vec::new())
            }

            ServerMessage::CompanyInfoUpdate { company_id, record } => {
                self.expect_replicating()?;
                self.roster.apply_company_update(company_id, record);
                Ok(Vec::new())
            }

            ServerMessage::CompanyDelete { company_id } => {
                self.expect_replicating()?;
                // The server already moved any players to spectating; the
                // replica mirrors that.
                let _ = self.roster.liquidate_company(company_id);
                Ok(Vec::new())
            }

            ServerMessage::CompanyInfoEnd => {
                self.expect_stage(JoinStage::GettingCompanyInfo)?;
                self.handshake.advance(JoinStage::Active)?;
                self.activate()?;
                info!(
                    client_id = self.client_id.unwrap_or(0),
                    frame = self.map_frame,
                    "join complete, lockstep running"
                );
                Ok(Vec::new())
            }

            ServerMessage::FrameUpdate(grant) => {
                let active = self.expect_active()?;
                active.clock.receive_grant(grant)?;
                Ok(Vec::new())
            }

            ServerMessage::SeedCheck { frame, seed_1, seed_2 } => {
                let active = self.expect_active()?;
                active.detector.receive_server(frame, seed_1, seed_2)?;
                Ok(Vec::new())
            }

            ServerMessage::GameInfo { .. } => {
                // Only discovery queriers ask for this.
                Err(SyncError::Protocol("unsolicited game info".into()))
            }

            ServerMessage::RconResponse { output } => {
                info!(%output, "rcon");
                Ok(Vec::new())
            }

            ServerMessage::Kicked { reason } => {
                self.handshake.fail();
                Err(SyncError::Connection(format!("kicked: {reason}")))
            }

            ServerMessage::Shutdown => {
                self.handshake.fail();
                Err(SyncError::Connection("server shutting down".into()))
            }
        }
    }

    /// Advance the local simulation by at most one frame.
    ///
    /// The closure runs the embedder's deterministic frame logic; it must
    /// draw all randomness from the provided generator. Returns a frame
    /// acknowledgment to send when one is due, `None` when the tick
    /// stalled at the ceiling or no ack is due yet.
    pub fn simulate_frame(
        &mut self,
        mut sim: impl FnMut(Frame, &mut SimulationRng),
    ) -> Result<Option<ClientMessage>, SyncError> {
        let frame_frequency = self
            .negotiated
            .as_ref()
            .map(|n| n.frame_frequency)
            .unwrap_or(1);
        let active = self.expect_active()?;

        let frame = match active.clock.try_tick() {
            TickOutcome::Advanced(frame) => frame,
            TickOutcome::Stalled => return Ok(None),
        };

        sim(frame, &mut active.rng);
        if let Err(desync) = active.detector.record_local(frame, active.rng.seed_pair()) {
            warn!(frame, "simulation diverged from server");
            return Err(desync.into());
        }

        if frame % frame_frequency == 0 {
            Ok(Some(ClientMessage::FrameAck { frame }))
        } else {
            Ok(None)
        }
    }

    /// Attempt a fresh join after `error`.
    ///
    /// On success every piece of join state is discarded: download buffer
    /// and progress, partial roster, assigned id, steady-state machinery.
    /// The caller reconnects the transport and calls [`connected`]
    /// again. Returns `false` when the error is fatal or the attempt
    /// budget is spent; the session is then terminally `Failed`.
    ///
    /// [`connected`]: ClientSession::connected
    pub fn retry(&mut self, error: &SyncError) -> bool {
        if !self.handshake.retry(error) {
            self.reset_join_state();
            return false;
        }
        self.reset_join_state();
        info!(attempt = self.handshake.attempts(), "retrying join");
        true
    }

    /// Abandon the session, producing the parting message.
    pub fn abort(&mut self) -> ClientMessage {
        self.handshake.fail();
        self.reset_join_state();
        ClientMessage::Quit
    }

    fn reset_join_state(&mut self) {
        self.negotiated = None;
        self.map_frame = 0;
        self.map_buffer = Vec::new();
        self.snapshot = None;
        self.client_id = None;
        self.roster = RosterTables::new();
        self.log = GameLog::new();
        self.active = None;
    }

    fn activate(&mut self) -> Result<(), SyncError> {
        let negotiated = self
            .negotiated
            .ok_or_else(|| SyncError::Protocol("activated without negotiation".into()))?;
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| SyncError::Protocol("activated without a snapshot".into()))?;

        let mut rng = SimulationRng::new(0);
        rng.set_state(snapshot.rng_state);

        // The snapshot frame is the floor; the first real grant arrives
        // with the next frame broadcast.
        let clock = ClientFrameClock::new(CeilingGrant {
            frame: snapshot.frame,
            ceiling: snapshot.frame + negotiated.frame_frequency,
        });
        let detector = DesyncDetector::new(negotiated.sync_frequency, negotiated.sync_mode);

        self.active = Some(ActiveState { rng, clock, detector });
        Ok(())
    }

    fn expect_stage(&self, stage: JoinStage) -> Result<(), SyncError> {
        if self.handshake.stage() == stage {
            Ok(())
        } else {
            Err(SyncError::Protocol(format!(
                "message not legal in stage {:?}",
                self.handshake.stage()
            )))
        }
    }

    /// Roster replication is legal from registration onward.
    fn expect_replicating(&self) -> Result<(), SyncError> {
        match self.handshake.stage() {
            JoinStage::Registering | JoinStage::GettingCompanyInfo | JoinStage::Active => Ok(()),
            stage => Err(SyncError::Protocol(format!(
                "roster update not legal in stage {stage:?}"
            ))),
        }
    }

    fn expect_active(&mut self) -> Result<&mut ActiveState, SyncError> {
        if self.handshake.stage() != JoinStage::Active {
            return Err(SyncError::Protocol(format!(
                "frame message not legal in stage {:?}",
                self.handshake.stage()
            )));
        }
        self.active
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("active stage without state".into()))
    }
}

// =============================================================================
// WEBSOCKET RUNNER
// =============================================================================

/// Drive a session over live WebSocket connections until it fails for
/// good or the server goes away.
///
/// Frames are simulated on a fixed wall-clock cadence; the ceiling keeps
/// the simulation honest regardless of how fast the ticker fires. A
/// retryable failure (lost connection, truncated transfer) triggers an
/// automatic re-join over a fresh connection until the attempt budget is
/// spent; only then does the failure surface.
pub async fn run_client(
    url: &str,
    config: ClientConfig,
    mut sim: impl FnMut(Frame, &mut SimulationRng),
) -> Result<(), JoinFailure> {
    let mut session = ClientSession::new(config);

    loop {
        let error = match run_attempt(url, &mut session, &mut sim).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        let stage = session.stage();
        warn!(?stage, %error, "session error");
        if matches!(error, SyncError::Desync(_)) {
            // The usual suspects behind a desync are on this log.
            session.game_log().dump();
        }
        if !session.retry(&error) {
            return Err(JoinFailure::at(stage, error));
        }
    }
}

/// One connect-join-simulate attempt over a fresh transport.
async fn run_attempt(
    url: &str,
    session: &mut ClientSession,
    sim: &mut impl FnMut(Frame, &mut SimulationRng),
) -> Result<(), SyncError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SyncError::Connection(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let join = session.connected()?;
    send_message(&mut ws_sender, &join).await?;

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(30));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let step = tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match ServerMessage::from_json(&text) {
                        Ok(server_msg) => session.apply(server_msg).map(Some),
                        Err(e) => Err(SyncError::Protocol(format!("bad frame: {e}"))),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    Err(SyncError::Connection("connection closed".into()))
                }
                Some(Err(e)) => Err(SyncError::Connection(e.to_string())),
                _ => Ok(None),
            },
            _ = ticker.tick(), if session.is_active() => {
                session.simulate_frame(&mut *sim).map(|ack| ack.map(|a| vec![a]))
            }
        };

        match step {
            Ok(Some(replies)) => {
                for reply in replies {
                    send_message(&mut ws_sender, &reply).await?;
                }
            }
            Ok(None) => {}
            Err(error) => return Err(error),
        }
    }
}

async fn send_message<S>(sender: &mut S, message: &ClientMessage) -> Result<(), SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = message
        .to_json()
        .map_err(|e| SyncError::Protocol(format!("serialize: {e}")))?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| SyncError::Connection(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================
