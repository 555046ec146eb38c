//! TCP client for connecting to a broadcaster
//!
//! The connection task owns the socket. It sends heartbeats, watches for a
//! silent server, checks that committed commands arrive without gaps and
//! resynchronizes through REQUEST_STATE when one is missed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mixer_core::DiffSet;
use serde::Serialize;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::locks::LockTable;
use crate::protocol::{
    ClientId, ClientInfo, Command, CommandAck, DeleteRoom, ErrorCode, ErrorReply, Heartbeat,
    JoinRoom, LockReleased, LockRequest, Opcode, RoomInfo, RoomProtocol, RoomState, SessionRole,
    SetClientName,
};

/// Client connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Used until the server announces its own cadence
    pub heartbeat_interval: Duration,
    /// Server silence after which the connection is dropped
    pub server_timeout: Duration,
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2_000),
            server_timeout: Duration::from_millis(10_000),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined,
    Disconnected,
}

/// Event received from the server
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// ROOM_STATE after a join or a resynchronization
    RoomJoined(RoomState),
    ClientJoined(ClientInfo),
    ClientLeft(ClientId),
    /// Command committed by another member, in sequence order
    Committed(Command),
    /// One of our own commands was committed
    Acknowledged { opcode: Opcode, sequence: u64 },
    LockReleased(LockReleased),
    /// A sequence number was skipped; a fresh ROOM_STATE is on its way
    GapDetected { expected: u64, received: u64 },
    Rooms(Vec<RoomInfo>),
    Clients(Vec<ClientInfo>),
    RoomDeleted(String),
    Error(ErrorReply),
    /// No traffic from the server within the timeout
    ServerTimeout,
    Disconnected,
}

struct ClientState {
    connection: ConnectionState,
    client_id: Option<ClientId>,
    room: Option<String>,
    protocol: Option<RoomProtocol>,
    members: Vec<ClientInfo>,
    last_sequence: u64,
    /// Live commands are dropped until ROOM_STATE arrives
    resyncing: bool,
    locks: LockTable,
    /// Relayed commands sent and not yet acked, oldest first
    in_flight: VecDeque<(Opcode, Option<String>)>,
}

impl ClientState {
    fn reset_room(&mut self) {
        self.connection = ConnectionState::Connected;
        self.room = None;
        self.protocol = None;
        self.members.clear();
        self.last_sequence = 0;
        self.resyncing = false;
        self.locks.clear();
        self.in_flight.clear();
    }
}

enum ClientCommand {
    Send(Command),
    Disconnect,
}

/// Client handle for network operations
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl Client {
    /// Connect with default settings
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, ClientConfig::default()).await
    }

    pub async fn connect_with(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        info!(addr = %addr, "Connecting to broadcaster");

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = tokio::io::split(stream);

        let state = Arc::new(RwLock::new(ClientState {
            connection: ConnectionState::Connected,
            client_id: None,
            room: None,
            protocol: None,
            members: Vec::new(),
            last_sequence: 0,
            resyncing: false,
            locks: LockTable::new(),
            in_flight: VecDeque::new(),
        }));

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (frame_tx, frame_rx) = mpsc::channel(256);

        tokio::spawn(reader_task(reader, frame_tx, config.max_frame_size));
        tokio::spawn(connection_task(
            writer,
            frame_rx,
            state.clone(),
            event_tx,
            cmd_rx,
            config,
        ));

        Ok(Client {
            state,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next server event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(cmd))
            .await
            .map_err(|_| Error::NotConnected)
    }

    async fn send_json<T: Serialize>(&self, opcode: Opcode, body: &T) -> Result<()> {
        self.send(Command::json(opcode, body)?).await
    }

    pub async fn join_room(
        &self,
        room: &str,
        protocol: RoomProtocol,
        display_name: &str,
    ) -> Result<()> {
        self.join(JoinRoom {
            room: room.to_string(),
            protocol,
            display_name: display_name.to_string(),
            role: SessionRole::Sender,
            keep_open: false,
        })
        .await
    }

    pub async fn join(&self, join: JoinRoom) -> Result<()> {
        self.send_json(Opcode::JoinRoom, &join).await
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.send(Command::empty(Opcode::LeaveRoom)).await
    }

    pub async fn send_diff(&self, diff: &DiffSet) -> Result<()> {
        self.send(Command::new(Opcode::SceneDiff, diff.to_bytes()?))
            .await
    }

    pub async fn send_blob(&self, blob: Vec<u8>) -> Result<()> {
        self.send(Command::new(Opcode::BlobUpdate, blob)).await
    }

    pub async fn request_lock(&self, resource: &str) -> Result<()> {
        let body = LockRequest {
            resource: resource.to_string(),
        };
        self.send_json(Opcode::RequestLock, &body).await
    }

    pub async fn release_lock(&self, resource: &str) -> Result<()> {
        let body = LockRequest {
            resource: resource.to_string(),
        };
        self.send_json(Opcode::ReleaseLock, &body).await
    }

    /// Ask for a fresh ROOM_STATE
    pub async fn request_state(&self) -> Result<()> {
        self.state.write().await.resyncing = true;
        self.send(Command::empty(Opcode::RequestState)).await
    }

    pub async fn list_rooms(&self) -> Result<()> {
        self.send(Command::empty(Opcode::ListRooms)).await
    }

    pub async fn list_clients(&self) -> Result<()> {
        self.send(Command::empty(Opcode::ListClients)).await
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        let body = SetClientName {
            name: name.to_string(),
        };
        self.send_json(Opcode::SetClientName, &body).await
    }

    pub async fn delete_room(&self, room: &str) -> Result<()> {
        let body = DeleteRoom {
            room: room.to_string(),
        };
        self.send_json(Opcode::DeleteRoom, &body).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    pub async fn client_id(&self) -> Option<ClientId> {
        self.state.read().await.client_id
    }

    pub async fn room(&self) -> Option<String> {
        self.state.read().await.room.clone()
    }

    pub async fn protocol(&self) -> Option<RoomProtocol> {
        self.state.read().await.protocol
    }

    /// Get current member list
    pub async fn members(&self) -> Vec<ClientInfo> {
        self.state.read().await.members.clone()
    }

    /// Last sequence number delivered in order
    pub async fn last_sequence(&self) -> u64 {
        self.state.read().await.last_sequence
    }

    pub async fn lock_holder(&self, resource: &str) -> Option<ClientId> {
        self.state.read().await.locks.holder(resource)
    }

    /// True if another member holds `resource`; local edits to it should wait
    pub async fn is_locked_by_other(&self, resource: &str) -> bool {
        let s = self.state.read().await;
        match s.client_id {
            Some(me) => s.locks.is_held_by_other(resource, me),
            None => s.locks.holder(resource).is_some(),
        }
    }
}

/// Reader task - forwards inbound frames to the connection task
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    frame_tx: mpsc::Sender<Result<Command>>,
    max_frame: u32,
) {
    loop {
        let result = read_frame(&mut reader, max_frame).await;
        let done = result.is_err();
        if frame_tx.send(result).await.is_err() || done {
            break;
        }
    }
}

/// Main connection task
async fn connection_task(
    mut writer: WriteHalf<TcpStream>,
    mut frame_rx: mpsc::Receiver<Result<Command>>,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    config: ClientConfig,
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut last_heard = Instant::now();

    loop {
        let silence = config.server_timeout.saturating_sub(last_heard.elapsed());

        tokio::select! {
            // Incoming frame from server
            frame = frame_rx.recv() => {
                match frame {
                    Some(Ok(cmd)) => {
                        last_heard = Instant::now();
                        if let Some(period) = announced_interval(&cmd) {
                            if period != heartbeat.period() {
                                debug!(interval_ms = period.as_millis() as u64, "Adopting server heartbeat interval");
                                heartbeat = tokio::time::interval_at(
                                    tokio::time::Instant::now() + period,
                                    period,
                                );
                            }
                        }
                        if let Some(resync) = handle_server_command(cmd, &state, &event_tx).await {
                            if let Err(e) = write_frame(&mut writer, &resync, config.max_frame_size).await {
                                warn!(error = %e, "Write error");
                                break;
                            }
                        }
                    }
                    Some(Err(Error::ConnectionClosed)) | None => {
                        debug!("Server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(cmd)) => {
                        track_outgoing(&cmd, &state).await;
                        if let Err(e) = write_frame(&mut writer, &cmd, config.max_frame_size).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                let last_sequence = state.read().await.last_sequence;
                let beat = Heartbeat {
                    last_sequence,
                    interval_ms: None,
                };
                let beat = match Command::json(Opcode::Heartbeat, &beat) {
                    Ok(beat) => beat,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode heartbeat");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &beat, config.max_frame_size).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }

            // Server watchdog
            _ = tokio::time::sleep(silence) => {
                warn!(elapsed_ms = last_heard.elapsed().as_millis() as u64, "Server appears dead - no traffic");
                let _ = event_tx.send(ClientEvent::ServerTimeout).await;
                break;
            }
        }
    }

    // Cleanup
    {
        let mut s = state.write().await;
        s.reset_room();
        s.connection = ConnectionState::Disconnected;
    }
    let _ = event_tx.send(ClientEvent::Disconnected).await;
    info!("Disconnected from broadcaster");
}

/// Heartbeat cadence carried by a server echo
fn announced_interval(cmd: &Command) -> Option<Duration> {
    if cmd.opcode != Opcode::Heartbeat {
        return None;
    }
    let beat: Heartbeat = cmd.decode().ok()?;
    beat.interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Remember relayed commands so their acks can be matched. Commands sent
/// right after JOIN_ROOM are tracked too: ROOM_STATE is queued ahead of
/// their acks.
async fn track_outgoing(cmd: &Command, state: &Arc<RwLock<ClientState>>) {
    let mut s = state.write().await;
    match cmd.opcode {
        Opcode::LeaveRoom => s.reset_room(),
        opcode if opcode.is_relayed() => {
            let resource = match opcode {
                Opcode::RequestLock | Opcode::ReleaseLock => {
                    cmd.decode::<LockRequest>().ok().map(|r| r.resource)
                }
                _ => None,
            };
            s.in_flight.push_back((opcode, resource));
        }
        _ => {}
    }
}

/// Apply a sequenced command to the lock table
fn fold_lock(locks: &mut LockTable, cmd: &Command) {
    match cmd.opcode {
        Opcode::RequestLock => {
            if let Ok(req) = cmd.decode::<LockRequest>() {
                locks.request(&req.resource, cmd.origin);
            }
        }
        Opcode::ReleaseLock => {
            if let Ok(req) = cmd.decode::<LockRequest>() {
                locks.release(&req.resource, cmd.origin);
            }
        }
        Opcode::LockReleased => {
            if let Ok(released) = cmd.decode::<LockReleased>() {
                locks.release(&released.resource, released.holder);
            }
        }
        _ => {}
    }
}

enum Ordered {
    Next,
    Duplicate,
    Gap { expected: u64 },
}

fn check_order(s: &mut ClientState, sequence: u64) -> Ordered {
    if sequence <= s.last_sequence {
        Ordered::Duplicate
    } else if sequence == s.last_sequence + 1 {
        s.last_sequence = sequence;
        Ordered::Next
    } else {
        Ordered::Gap {
            expected: s.last_sequence + 1,
        }
    }
}

/// Handle a command from the server. Returns a command to send back when a
/// resynchronization is needed.
async fn handle_server_command(
    cmd: Command,
    state: &Arc<RwLock<ClientState>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> Option<Command> {
    let mut gap = None;

    let event = match cmd.opcode {
        Opcode::RoomState => match cmd.decode::<RoomState>() {
            Ok(room_state) => {
                let mut s = state.write().await;
                s.connection = ConnectionState::Joined;
                s.client_id = Some(room_state.client_id);
                s.room = Some(room_state.room.clone());
                s.protocol = Some(room_state.protocol);
                s.members = room_state.members.clone();
                s.last_sequence = room_state.last_sequence;
                s.resyncing = false;
                s.locks = LockTable::from_holders(&room_state.locks);
                info!(
                    room = %room_state.room,
                    client_id = %room_state.client_id,
                    last_sequence = room_state.last_sequence,
                    "Room state received"
                );
                Some(ClientEvent::RoomJoined(room_state))
            }
            Err(e) => {
                warn!(error = %e, "Invalid ROOM_STATE");
                None
            }
        },
        Opcode::ClientJoined => match cmd.decode::<ClientInfo>() {
            Ok(info) => {
                state.write().await.members.push(info.clone());
                Some(ClientEvent::ClientJoined(info))
            }
            Err(_) => None,
        },
        Opcode::ClientLeft => match cmd.decode::<ClientId>() {
            Ok(id) => {
                state.write().await.members.retain(|m| m.id != id);
                Some(ClientEvent::ClientLeft(id))
            }
            Err(_) => None,
        },
        Opcode::CommandAck => {
            let ack = cmd.decode::<CommandAck>().ok();
            match (cmd.sequence, ack) {
                (Some(sequence), Some(ack)) => {
                    let mut s = state.write().await;
                    match s.in_flight.pop_front() {
                        Some((opcode, resource)) if opcode == ack.opcode => {
                            if let (Some(me), Some(resource)) = (s.client_id, resource) {
                                match opcode {
                                    Opcode::RequestLock => {
                                        s.locks.request(&resource, me);
                                    }
                                    Opcode::ReleaseLock => {
                                        s.locks.release(&resource, me);
                                    }
                                    _ => {}
                                }
                            }
                        }
                        other => {
                            warn!(expected = ?other, acked = ?ack.opcode, "Unmatched command ack")
                        }
                    }
                    // The ack still counts while resynchronizing; only the
                    // sequence check is skipped
                    if !s.resyncing {
                        if let Ordered::Gap { expected } = check_order(&mut s, sequence) {
                            s.resyncing = true;
                            gap = Some((expected, sequence));
                        }
                    }
                    Some(ClientEvent::Acknowledged {
                        opcode: ack.opcode,
                        sequence,
                    })
                }
                _ => {
                    warn!("Invalid COMMAND_ACK");
                    None
                }
            }
        }
        opcode if opcode.is_relayed() || opcode == Opcode::LockReleased => {
            match cmd.sequence {
                None => {
                    warn!(opcode = ?opcode, "Unsequenced relayed command");
                    None
                }
                Some(sequence) => {
                    let mut s = state.write().await;
                    if s.resyncing {
                        debug!(sequence, "Dropping live command while resynchronizing");
                        None
                    } else {
                        match check_order(&mut s, sequence) {
                            Ordered::Duplicate => {
                                debug!(sequence, "Dropping duplicate command");
                                None
                            }
                            Ordered::Gap { expected } => {
                                s.resyncing = true;
                                gap = Some((expected, sequence));
                                None
                            }
                            Ordered::Next => {
                                fold_lock(&mut s.locks, &cmd);
                                if opcode == Opcode::LockReleased {
                                    cmd.decode().ok().map(ClientEvent::LockReleased)
                                } else {
                                    Some(ClientEvent::Committed(cmd))
                                }
                            }
                        }
                    }
                }
            }
        }
        Opcode::Heartbeat => {
            let beat: Heartbeat = cmd.decode().unwrap_or_default();
            debug!(server_sequence = beat.last_sequence, "Heartbeat echo");
            None
        }
        Opcode::ListRooms => cmd.decode().ok().map(ClientEvent::Rooms),
        Opcode::ListClients => cmd.decode().ok().map(ClientEvent::Clients),
        Opcode::DeleteRoom => cmd
            .decode::<DeleteRoom>()
            .ok()
            .map(|d| ClientEvent::RoomDeleted(d.room)),
        Opcode::Error => match cmd.decode::<ErrorReply>() {
            Ok(err) => {
                warn!(code = ?err.code, message = %err.message, "Server error");
                if err.code == ErrorCode::NotJoined {
                    // A relayed command refused outside a room never gets an ack
                    let mut s = state.write().await;
                    if s.room.is_none() {
                        s.in_flight.pop_front();
                    }
                }
                Some(ClientEvent::Error(err))
            }
            Err(_) => None,
        },
        opcode => {
            debug!(opcode = ?opcode, "Ignoring unexpected command");
            None
        }
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }

    let (expected, received) = gap?;
    warn!(expected, received, "Sequence gap, requesting room state");
    let _ = event_tx
        .send(ClientEvent::GapDetected { expected, received })
        .await;
    Some(Command::empty(Opcode::RequestState))
}
