//! Server Session
//!
//! The authoritative side of the lockstep protocol. One `ServerSession`
//! owns the roster, the frame clock and the simulation PRNG, and turns
//! incoming client messages into batches of outbound messages keyed by
//! connection. Like the client machine it is free of I/O; the WebSocket
//! layer in `server` pumps it.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::core::rng::SimulationRng;
use crate::roster::{
    ClientId, ClientRecord, GameDate, GameInfoSnapshot, GameLog, GameLogEvent, MapInfo,
    RosterConfig, RosterTables, ServerIdentity,
};
use crate::sync::frame::{Frame, FrameOrderViolation, ServerFrameClock};
use crate::sync::seed::{SeedSampler, SyncMode};

use super::discovery::BanList;
use super::error::SyncError;
use super::handshake::{AuthPolicy, JoinRefusal};
use super::protocol::{
    ClientMessage, JoinRequest, MapSnapshot, RegisterRequest, ServerMessage, MAP_CHUNK_SIZE,
};

/// Days per in-game month, for the auto-clean cadence.
const DAYS_PER_MONTH: u32 = 30;

/// Opaque connection identifier, assigned by the transport layer.
pub type ConnId = u64;

/// Messages to deliver, keyed by connection.
pub type Outbound = Vec<(ConnId, ServerMessage)>;

/// Console command handler injected by the embedder.
pub type RconHandler = Box<dyn FnMut(&str) -> String + Send>;

/// Server session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advertised identity.
    pub identity: ServerIdentity,
    /// Map descriptor.
    pub map: MapInfo,
    /// Roster capacities and auto-clean policy.
    pub roster: RosterConfig,
    /// Frames between ceiling grants.
    pub frame_frequency: u32,
    /// Base frames between seed comparisons.
    pub sync_frequency: u32,
    /// The seed-exchange mode this server runs.
    pub sync_mode: SyncMode,
    /// Console password; empty disables the console.
    pub rcon_password: String,
    /// In-simulation date the game started at.
    pub start_date: GameDate,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: ServerIdentity::default(),
            map: MapInfo::default(),
            roster: RosterConfig::default(),
            frame_frequency: crate::DEFAULT_FRAME_FREQUENCY,
            sync_frequency: crate::DEFAULT_SYNC_FREQUENCY,
            sync_mode: SyncMode::default(),
            rcon_password: String::new(),
            start_date: 0,
        }
    }
}

/// Where a connection stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStage {
    /// Transport open, no join request yet.
    Connected,
    /// Authorized, queued behind another joiner's map transfer.
    Queued,
    /// Map sent, awaiting registration.
    Registering,
    /// Fully joined.
    Active {
        /// Roster id.
        client_id: ClientId,
        /// Highest frame this client acknowledged.
        acked_frame: Frame,
    },
}

#[derive(Debug)]
struct Connection {
    address: String,
    stage: ConnStage,
}

/// The authoritative lockstep session.
pub struct ServerSession {
    config: SessionConfig,
    policy: AuthPolicy,
    roster: RosterTables,
    clock: ServerFrameClock,
    rng: SimulationRng,
    sampler: SeedSampler,
    bans: BanList,
    connections: BTreeMap<ConnId, Connection>,
    /// Joiners waiting for the single map-transfer slot.
    wait_queue: VecDeque<ConnId>,
    /// Connection currently holding the transfer slot.
    transferring: Option<ConnId>,
    game_date: GameDate,
    frames_into_day: u32,
    log: GameLog,
    rcon: Option<RconHandler>,
    /// Connection mirroring the server console, if any.
    console_redirect: Option<ConnId>,
}

impl ServerSession {
    /// New session at frame zero with the given simulation seed.
    pub fn new(config: SessionConfig, seed: u32) -> Self {
        let policy = AuthPolicy {
            revision: config.identity.revision.clone(),
            password: config.identity.password.clone(),
            sync_mode: config.sync_mode,
        };
        let clock = ServerFrameClock::new(config.frame_frequency);
        let sampler = SeedSampler::new(config.sync_frequency, config.sync_mode);
        let game_date = config.start_date;
        let mut log = GameLog::new();
        log.record(0, GameLogEvent::Started { revision: config.identity.revision.clone() });
        Self {
            config,
            policy,
            roster: RosterTables::new(),
            clock,
            rng: SimulationRng::new(seed),
            sampler,
            bans: BanList::new(),
            connections: BTreeMap::new(),
            wait_queue: VecDeque::new(),
            transferring: None,
            game_date,
            frames_into_day: 0,
            log,
            rcon: None,
            console_redirect: None,
        }
    }

    /// Current server frame.
    pub fn frame(&self) -> Frame {
        self.clock.frame()
    }

    /// Current in-simulation date.
    pub fn game_date(&self) -> GameDate {
        self.game_date
    }

    /// The roster.
    pub fn roster(&self) -> &RosterTables {
        &self.roster
    }

    /// Open connections, joined or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The host-ban table.
    pub fn bans_mut(&mut self) -> &mut BanList {
        &mut self.bans
    }

    /// Install the console command handler.
    pub fn set_rcon_handler(&mut self, handler: RconHandler) {
        self.rcon = Some(handler);
    }

    /// The log of simulation-affecting changes.
    pub fn game_log(&self) -> &GameLog {
        &self.log
    }

    /// Record a simulation-affecting setting change in the game log.
    pub fn log_setting_change(&mut self, name: &str, old: &str, new: &str) {
        self.log.record(
            self.clock.frame(),
            GameLogEvent::SettingChanged {
                name: name.to_string(),
                old: old.to_string(),
                new: new.to_string(),
            },
        );
    }

    /// Mirror server console output to one connection, or stop mirroring.
    pub fn redirect_console_to(&mut self, conn: Option<ConnId>) {
        self.console_redirect = conn;
    }

    /// Emit a line of server console output.
    ///
    /// Always logged locally; additionally mirrored to the redirect
    /// target when one is set.
    pub fn console_output(&self, line: &str) -> Outbound {
        info!("{line}");
        match self.console_redirect {
            Some(conn) if self.connections.contains_key(&conn) => {
                vec![(conn, ServerMessage::RconResponse { output: line.to_string() })]
            }
            _ => Vec::new(),
        }
    }

    /// A transport connection opened.
    pub fn handle_connect(&mut self, conn: ConnId, address: impl Into<String>) {
        let address = address.into();
        debug!(conn, %address, "connection opened");
        self.connections.insert(
            conn,
            Connection { address, stage: ConnStage::Connected },
        );
    }

    /// Dispatch one client message.
    pub fn handle_message(
        &mut self,
        conn: ConnId,
        message: ClientMessage,
    ) -> Result<Outbound, SyncError> {
        match message {
            ClientMessage::Join(request) => self.handle_join(conn, request),
            ClientMessage::Register(request) => self.handle_register(conn, request),
            ClientMessage::FrameAck { frame } => {
                self.handle_frame_ack(conn, frame)?;
                Ok(Vec::new())
            }
            ClientMessage::Rcon { password, command } => Ok(self.handle_rcon(conn, &password, &command)),
            ClientMessage::Query { .. } => {
                Ok(vec![(conn, ServerMessage::GameInfo { info: self.query_info() })])
            }
            ClientMessage::Quit => Ok(self.handle_disconnect(conn)),
        }
    }

    /// A join request arrived.
    pub fn handle_join(
        &mut self,
        conn: ConnId,
        request: JoinRequest,
    ) -> Result<Outbound, SyncError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or_else(|| SyncError::Protocol(format!("join from unknown connection {conn}")))?;
        if connection.stage != ConnStage::Connected {
            return Err(SyncError::Protocol("duplicate join request".into()));
        }

        let address = connection.address.clone();
        if let Err(refusal) = self.screen_join(&address, &request) {
            info!(conn, %refusal, "join refused");
            return Ok(vec![(conn, ServerMessage::JoinRefused(refusal))]);
        }

        let mut out = vec![(
            conn,
            ServerMessage::JoinAccepted {
                sync_mode: self.config.sync_mode,
                frame_frequency: self.config.frame_frequency,
                sync_frequency: self.config.sync_frequency,
            },
        )];

        // One map transfer at a time; later joiners queue.
        if self.transferring.is_some() {
            // The transfer-slot holder counts as ahead too.
            let ahead = (self.wait_queue.len() + 1).min(u8::MAX as usize) as u8;
            self.wait_queue.push_back(conn);
            self.set_stage(conn, ConnStage::Queued);
            out.push((conn, ServerMessage::Wait { clients_ahead: ahead }));
        } else {
            out.extend(self.start_transfer(conn)?);
        }
        Ok(out)
    }

    fn screen_join(&self, address: &str, request: &JoinRequest) -> Result<(), JoinRefusal> {
        if self.bans.is_banned(address) {
            return Err(JoinRefusal::Banned);
        }
        if self.roster.client_count() >= self.config.roster.max_clients {
            return Err(JoinRefusal::ServerFull);
        }
        self.policy.authorize(request)
    }

    /// Snapshot the simulation and emit the full transfer for `conn`.
    fn start_transfer(&mut self, conn: ConnId) -> Result<Outbound, SyncError> {
        let snapshot = MapSnapshot {
            frame: self.clock.frame(),
            rng_state: self.rng.state(),
            roster: self.roster.replicated(),
            log: self.log.clone(),
        };
        let bytes = snapshot.encode()?;

        let mut out = vec![(
            conn,
            ServerMessage::MapBegin {
                frame: snapshot.frame,
                total_bytes: bytes.len() as u64,
            },
        )];
        for chunk in bytes.chunks(MAP_CHUNK_SIZE) {
            out.push((conn, ServerMessage::MapChunk { data: chunk.to_vec() }));
        }
        out.push((conn, ServerMessage::MapDone));

        self.transferring = Some(conn);
        self.set_stage(conn, ConnStage::Registering);
        debug!(conn, bytes = bytes.len(), "map transfer started");
        Ok(out)
    }

    /// The joiner announced its identity; put it on the roster.
    pub fn handle_register(
        &mut self,
        conn: ConnId,
        request: RegisterRequest,
    ) -> Result<Outbound, SyncError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or_else(|| SyncError::Protocol(format!("register from unknown connection {conn}")))?;
        if connection.stage != ConnStage::Registering {
            return Err(SyncError::Protocol("register before map transfer".into()));
        }

        let client_id = self.roster.allocate_client_id();
        let record = ClientRecord {
            id: client_id,
            name: request.name,
            language: request.language,
            plays_as: None,
            address: connection.address.clone(),
            join_date: self.game_date,
            unique_id: request.unique_id,
        };
        self.roster.register_client(record.clone(), &self.config.roster)?;
        self.set_stage(conn, ConnStage::Active { client_id, acked_frame: self.clock.frame() });
        self.log.record(
            self.clock.frame(),
            GameLogEvent::ClientJoined { client_id, name: record.name.clone() },
        );

        // Everyone learns about the newcomer; the newcomer additionally
        // gets its id and the company roster.
        let mut out = self.broadcast(ServerMessage::ClientInfoUpdate { record });
        out.push((conn, ServerMessage::Welcome { client_id }));
        for (id, company) in self.roster.companies_with_ids() {
            out.push((
                conn,
                ServerMessage::CompanyInfoUpdate { company_id: id, record: company.replicated() },
            ));
        }
        out.push((conn, ServerMessage::CompanyInfoEnd));

        info!(conn, client_id, "client joined");

        self.release_transfer_slot(conn, &mut out)?;
        Ok(out)
    }

    /// Record an acknowledgment; a frame past the granted ceiling is
    /// proof the client broke lockstep.
    pub fn handle_frame_ack(&mut self, conn: ConnId, frame: Frame) -> Result<(), SyncError> {
        let ceiling = self.clock.ceiling();
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or_else(|| SyncError::Protocol(format!("ack from unknown connection {conn}")))?;
        match &mut connection.stage {
            ConnStage::Active { acked_frame, .. } => {
                if frame > ceiling {
                    warn!(conn, frame, ceiling, "client ran past the ceiling");
                    return Err(FrameOrderViolation { local_frame: frame, ceiling }.into());
                }
                *acked_frame = (*acked_frame).max(frame);
                Ok(())
            }
            _ => Err(SyncError::Protocol("ack from a client that has not joined".into())),
        }
    }

    /// Console command pass-through.
    pub fn handle_rcon(&mut self, conn: ConnId, password: &str, command: &str) -> Outbound {
        let output = if self.config.rcon_password.is_empty() {
            "console access is disabled".to_string()
        } else if password != self.config.rcon_password {
            warn!(conn, "rcon authentication failed");
            "wrong console password".to_string()
        } else {
            match self.rcon.as_mut() {
                Some(handler) => handler(command),
                None => "no console handler installed".to_string(),
            }
        };
        vec![(conn, ServerMessage::RconResponse { output })]
    }

    /// A connection went away, orderly or not.
    pub fn handle_disconnect(&mut self, conn: ConnId) -> Outbound {
        let Some(connection) = self.connections.remove(&conn) else {
            return Vec::new();
        };
        self.wait_queue.retain(|c| *c != conn);
        if self.console_redirect == Some(conn) {
            self.console_redirect = None;
        }

        let mut out = Vec::new();
        if let ConnStage::Active { client_id, .. } = connection.stage {
            // Roster removal is synchronous with the disconnect; the
            // broadcast goes out in the same batch.
            self.roster.remove_client(client_id);
            self.log.record(self.clock.frame(), GameLogEvent::ClientLeft { client_id });
            out = self.broadcast(ServerMessage::ClientQuit { client_id });
            info!(conn, client_id, "client left");
        }

        if self.release_transfer_slot(conn, &mut out).is_err() {
            // Snapshot encoding failed for the promoted joiner; it will
            // time out and retry.
            warn!(conn, "failed to promote queued joiner");
        }
        out
    }

    /// Kick a client by roster id.
    pub fn kick(&mut self, client_id: ClientId, reason: &str) -> Outbound {
        let conn = self.connections.iter().find_map(|(conn, c)| match c.stage {
            ConnStage::Active { client_id: id, .. } if id == client_id => Some(*conn),
            _ => None,
        });
        let Some(conn) = conn else { return Vec::new() };

        let mut out = vec![(conn, ServerMessage::Kicked { reason: reason.to_string() })];
        out.extend(self.handle_disconnect(conn));
        out
    }

    /// Advance the simulation by one frame.
    ///
    /// The closure runs the embedder's deterministic frame logic against
    /// the authoritative generator; the resulting seed samples and any
    /// due ceiling grant are broadcast to every active client.
    pub fn advance_frame(&mut self, mut sim: impl FnMut(Frame, &mut SimulationRng)) -> Outbound {
        let grant = self.clock.advance();
        let frame = self.clock.frame();
        sim(frame, &mut self.rng);

        let mut out = Vec::new();
        if let Some(grant) = grant {
            out.extend(self.broadcast(ServerMessage::FrameUpdate(grant)));
        }
        if let Some((frame, seed_1, seed_2)) = self.sampler.sample(frame, self.rng.seed_pair()) {
            out.extend(self.broadcast(ServerMessage::SeedCheck { frame, seed_1, seed_2 }));
        }

        self.frames_into_day += 1;
        if self.frames_into_day >= crate::FRAMES_PER_DAY {
            self.frames_into_day = 0;
            self.game_date += 1;
            if self.game_date % DAYS_PER_MONTH == 0 {
                out.extend(self.monthly_tick());
            }
        }
        out
    }

    /// Monthly bookkeeping: run the auto-clean policy if configured.
    fn monthly_tick(&mut self) -> Outbound {
        let Some(policy) = self.config.roster.autoclean else {
            return Vec::new();
        };
        let removed = self.roster.autoclean_pass(policy);
        let mut out = Vec::new();
        for company_id in removed {
            info!(company_id, "auto-cleaned abandoned company");
            self.log
                .record(self.clock.frame(), GameLogEvent::CompanyRemoved { company_id });
            out.extend(self.broadcast(ServerMessage::CompanyDelete { company_id }));
        }
        out
    }

    /// The discovery snapshot.
    pub fn query_info(&self) -> GameInfoSnapshot {
        GameInfoSnapshot::build(
            &self.config.identity,
            &self.config.map,
            &self.roster,
            &self.config.roster,
            self.game_date,
            self.config.start_date,
        )
    }

    /// Notify everyone and drop all connections.
    pub fn teardown(&mut self) -> Outbound {
        let out = self
            .connections
            .keys()
            .map(|conn| (*conn, ServerMessage::Shutdown))
            .collect();
        self.connections.clear();
        self.wait_queue.clear();
        self.transferring = None;
        out
    }

    /// If `conn` held the transfer slot, free it and promote the next
    /// queued joiner.
    fn release_transfer_slot(&mut self, conn: ConnId, out: &mut Outbound) -> Result<(), SyncError> {
        if self.transferring != Some(conn) {
            return Ok(());
        }
        self.transferring = None;
        if let Some(next) = self.wait_queue.pop_front() {
            out.extend(self.start_transfer(next)?);
        }
        Ok(())
    }

    fn broadcast(&self, message: ServerMessage) -> Outbound {
        self.connections
            .iter()
            .filter(|(_, c)| matches!(c.stage, ConnStage::Active { .. }))
            .map(|(conn, _)| (*conn, message.clone()))
            .collect()
    }

    fn set_stage(&mut self, conn: ConnId, stage: ConnStage) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.stage = stage;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
