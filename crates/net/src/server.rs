//! Broadcaster relay server
//!
//! Accepts connections, routes them into rooms by name and supervises room
//! lifecycle. Payloads of relayed commands are not interpreted, apart from
//! lock resources and the scene snapshot kept for Generic rooms.
//!
//! A room mutex is always taken last: nothing waits on `rooms` or `clients`
//! while holding one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::BroadcasterConfig;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{
    ClientId, ClientInfo, Command, DeleteRoom, ErrorReply, Heartbeat, JoinRoom, Opcode, RoomInfo,
    SetClientName,
};
use crate::room::{Outbound, Room};
use crate::session::{ClientSession, SessionState};

/// How long a closing connection may take to flush its queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

struct ClientEntry {
    session: ClientSession,
    outbound: Outbound,
}

/// Server state shared across tasks
struct ServerState {
    config: BroadcasterConfig,
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    next_client_id: AtomicU32,
}

impl ServerState {
    async fn room(&self, name: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(name).cloned()
    }

    async fn room_of(&self, id: ClientId) -> Result<Arc<Mutex<Room>>> {
        let name = {
            let clients = self.clients.read().await;
            clients
                .get(&id)
                .and_then(|c| c.session.room.clone())
                .ok_or(Error::NotJoined)?
        };
        self.room(&name).await.ok_or(Error::NotJoined)
    }

    async fn reply(&self, id: ClientId, cmd: Command) {
        let clients = self.clients.read().await;
        if let Some(entry) = clients.get(&id) {
            if !entry.outbound.push(cmd) {
                warn!(client_id = %id, "Outbound queue full, closing connection");
                entry.outbound.close();
            }
        }
    }

    async fn reply_error(&self, id: ClientId, err: &Error) {
        let Some(code) = err.code() else {
            return;
        };
        let body = ErrorReply {
            code,
            message: err.to_string(),
        };
        match Command::json(Opcode::Error, &body) {
            Ok(cmd) => self.reply(id, cmd).await,
            Err(e) => warn!(error = %e, "Failed to encode ERROR"),
        }
    }

    async fn transition(&self, id: ClientId, next: SessionState) -> Result<()> {
        let mut clients = self.clients.write().await;
        match clients.get_mut(&id) {
            Some(entry) => entry.session.transition(next),
            None => Err(Error::NotConnected),
        }
    }
}

/// Running broadcaster handle
pub struct Broadcaster {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broadcaster {
    /// Bind and start accepting connections
    pub async fn listen(config: BroadcasterConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, replay_capacity = config.replay_capacity, "Broadcaster started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(ServerState {
            config,
            rooms: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU32::new(1),
        });

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_tx.clone()));
        tokio::spawn(reaper_task(state.clone(), shutdown_tx.subscribe()));

        Ok(Broadcaster {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.state.config
    }

    pub async fn rooms(&self) -> Vec<RoomInfo> {
        list_rooms(&self.state).await
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        list_clients(&self.state).await
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Broadcaster shutdown initiated");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            state.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let max_frame = state.config.max_frame_size;

    let id = ClientId(state.next_client_id.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(state.config.outbound_queue);
    let closer = Arc::new(Notify::new());

    let mut session = ClientSession::new(id);
    if let Err(e) = session.transition(SessionState::Handshaking) {
        error!(client_id = %id, error = %e, "Session setup failed");
        return;
    }
    state.clients.write().await.insert(
        id,
        ClientEntry {
            session,
            outbound: Outbound::new(tx, closer.clone()),
        },
    );

    let writer_handle = tokio::spawn(writer_task(writer, rx, max_frame, closer.clone()));
    info!(addr = %addr, client_id = %id, "Client connected");

    let deadline = state.config.heartbeat_timeout();
    loop {
        tokio::select! {
            result = tokio::time::timeout(deadline, read_frame(&mut reader, max_frame)) => {
                match result.unwrap_or(Err(Error::SessionTimeout)) {
                    Ok(cmd) => {
                        if let Err(e) = handle_command(&state, id, cmd).await {
                            if e.is_fatal() {
                                warn!(client_id = %id, error = %e, "Closing connection");
                                state.reply_error(id, &e).await;
                                break;
                            }
                            debug!(client_id = %id, error = %e, "Command rejected");
                            state.reply_error(id, &e).await;
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!(client_id = %id, "Connection closed");
                        break;
                    }
                    Err(Error::SessionTimeout) => {
                        warn!(client_id = %id, timeout_ms = deadline.as_millis() as u64, "Heartbeat deadline missed");
                        break;
                    }
                    Err(e) => {
                        warn!(client_id = %id, error = %e, "Read error");
                        state.reply_error(id, &e).await;
                        break;
                    }
                }
            }
            _ = closer.notified() => {
                debug!(client_id = %id, "Connection closed by server");
                break;
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    // Cleanup
    let _ = state.transition(id, SessionState::Disconnecting).await;
    leave_room(&state, id).await;
    if let Some(mut entry) = state.clients.write().await.remove(&id) {
        let _ = entry.session.transition(SessionState::Closed);
    }

    // Every sender is gone now, so the writer ends once the queue is flushed
    let mut writer_handle = writer_handle;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    info!(client_id = %id, "Client disconnected");
}

/// Writer task - sends queued commands to the client. A failed write ends
/// the whole connection.
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<Command>,
    max_frame: u32,
    closer: Arc<Notify>,
) {
    while let Some(cmd) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &cmd, max_frame).await {
            warn!(opcode = ?cmd.opcode, error = %e, "Write failed, closing connection");
            closer.notify_one();
            break;
        }
    }
}

/// Handle one inbound command
async fn handle_command(state: &Arc<ServerState>, id: ClientId, cmd: Command) -> Result<()> {
    match cmd.opcode {
        Opcode::JoinRoom => join_room(state, id, cmd.decode()?).await,
        Opcode::LeaveRoom => {
            if leave_room(state, id).await.is_none() {
                return Err(Error::NotJoined);
            }
            state.transition(id, SessionState::Handshaking).await
        }
        Opcode::Heartbeat => heartbeat(state, id, &cmd).await,
        Opcode::RequestState => {
            let room = state.room_of(id).await?;
            let mut room = room.lock().await;
            room.resend_state(id)
        }
        Opcode::ListRooms => {
            let rooms = list_rooms(state).await;
            state
                .reply(id, Command::json(Opcode::ListRooms, &rooms)?)
                .await;
            Ok(())
        }
        Opcode::ListClients => {
            let clients = list_clients(state).await;
            state
                .reply(id, Command::json(Opcode::ListClients, &clients)?)
                .await;
            Ok(())
        }
        Opcode::SetClientName => {
            let SetClientName { name } = cmd.decode()?;
            let room = {
                let mut clients = state.clients.write().await;
                let entry = clients.get_mut(&id).ok_or(Error::NotConnected)?;
                entry.session.name = name.clone();
                entry.session.room.clone()
            };
            if let Some(room) = room {
                if let Some(room) = state.room(&room).await {
                    room.lock().await.rename(id, &name);
                }
            }
            debug!(client_id = %id, name = %name, "Client renamed");
            Ok(())
        }
        Opcode::DeleteRoom => {
            let DeleteRoom { room } = cmd.decode()?;
            delete_room(state, &room).await?;
            state
                .reply(id, Command::json(Opcode::DeleteRoom, &DeleteRoom { room })?)
                .await;
            Ok(())
        }
        opcode if opcode.is_relayed() => {
            let room = state.room_of(id).await?;
            let sequence = room.lock().await.relay(cmd, id)?;
            debug!(client_id = %id, opcode = ?opcode, sequence, "Command committed");
            Ok(())
        }
        opcode => Err(Error::InvalidRequest(format!(
            "{:?} cannot be sent by a client",
            opcode
        ))),
    }
}

async fn join_room(state: &Arc<ServerState>, id: ClientId, join: JoinRoom) -> Result<()> {
    let (info, outbound) = {
        let mut clients = state.clients.write().await;
        let entry = clients.get_mut(&id).ok_or(Error::NotConnected)?;
        if let Some(current) = &entry.session.room {
            return Err(Error::AlreadyJoined(current.clone()));
        }
        entry.session.name = join.display_name.clone();
        entry.session.role = join.role;
        let mut info = entry.session.info();
        info.room = Some(join.room.clone());
        (info, entry.outbound.clone())
    };

    {
        let mut rooms = state.rooms.write().await;
        let created = !rooms.contains_key(&join.room);
        let room = rooms
            .entry(join.room.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(
                    Room::new(&join.room, join.protocol, state.config.replay_capacity)
                        .with_max_frame_size(state.config.max_frame_size),
                ))
            })
            .clone();

        let mut room = room.lock().await;
        if let Err(e) = room.admit(info, join.protocol, outbound) {
            if created {
                rooms.remove(&join.room);
            }
            return Err(e);
        }
        if join.keep_open {
            room.set_keep_open(true);
        }
    }

    let mut clients = state.clients.write().await;
    let entry = clients.get_mut(&id).ok_or(Error::NotConnected)?;
    entry.session.room = Some(join.room.clone());
    entry.session.transition(SessionState::Joined)?;
    // ROOM_STATE is already queued ahead of any live command
    entry.session.transition(SessionState::Active)?;
    Ok(())
}

/// Remove `id` from its room, if any. Returns the room name.
async fn leave_room(state: &Arc<ServerState>, id: ClientId) -> Option<String> {
    let name = {
        let mut clients = state.clients.write().await;
        clients.get_mut(&id)?.session.room.take()?
    };
    if let Some(room) = state.room(&name).await {
        room.lock().await.depart(id);
    }
    Some(name)
}

async fn heartbeat(state: &Arc<ServerState>, id: ClientId, cmd: &Command) -> Result<()> {
    let beat: Heartbeat = if cmd.payload.is_empty() {
        Heartbeat::default()
    } else {
        cmd.decode()?
    };

    if let Some(entry) = state.clients.write().await.get_mut(&id) {
        entry.session.last_acked_sequence = entry.session.last_acked_sequence.max(beat.last_sequence);
    }

    let last_sequence = match state.room_of(id).await {
        Ok(room) => room.lock().await.last_sequence(),
        Err(_) => 0,
    };
    let echo = Heartbeat {
        last_sequence,
        interval_ms: Some(state.config.heartbeat_interval_ms),
    };
    state
        .reply(id, Command::json(Opcode::Heartbeat, &echo)?)
        .await;
    Ok(())
}

async fn delete_room(state: &Arc<ServerState>, name: &str) -> Result<()> {
    let mut rooms = state.rooms.write().await;
    let room = rooms
        .get(name)
        .cloned()
        .ok_or_else(|| Error::RoomNotFound(name.to_string()))?;
    let mut room = room.lock().await;
    if !room.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "room '{}' still has {} member(s)",
            name,
            room.len()
        )));
    }
    room.close();
    rooms.remove(name);
    info!(room = %name, "Room deleted");
    Ok(())
}

async fn list_rooms(state: &Arc<ServerState>) -> Vec<RoomInfo> {
    let rooms: Vec<_> = state.rooms.read().await.values().cloned().collect();
    let mut infos = Vec::with_capacity(rooms.len());
    for room in rooms {
        infos.push(room.lock().await.info());
    }
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    infos
}

async fn list_clients(state: &Arc<ServerState>) -> Vec<ClientInfo> {
    let mut infos: Vec<ClientInfo> = state
        .clients
        .read()
        .await
        .values()
        .map(|c| c.session.info())
        .collect();
    infos.sort_by_key(|c| c.id);
    infos
}

/// Reaper task - closes rooms idle past the grace window
async fn reaper_task(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(state.config.reap_interval());
    let grace = state.config.idle_room_grace();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut rooms = state.rooms.write().await;
                let mut expired = Vec::new();
                for (name, room) in rooms.iter() {
                    let mut room = room.lock().await;
                    if room.is_expired(grace, now) {
                        room.close();
                        expired.push(name.clone());
                    }
                }
                for name in expired {
                    rooms.remove(&name);
                    debug!(room = %name, "Idle room reaped");
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_FRAME_SIZE;
    use crate::protocol::{ErrorCode, RoomProtocol, RoomState, RoomStatus};

    fn test_config() -> BroadcasterConfig {
        BroadcasterConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..BroadcasterConfig::default()
        }
    }

    async fn connect(server: &Broadcaster) -> TcpStream {
        TcpStream::connect(server.addr()).await.unwrap()
    }

    async fn send(stream: &mut TcpStream, cmd: Command) {
        write_frame(stream, &cmd, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Command {
        tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(stream, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .unwrap()
        .unwrap()
    }

    fn join(room: &str, protocol: RoomProtocol) -> Command {
        Command::json(
            Opcode::JoinRoom,
            &JoinRoom {
                room: room.into(),
                protocol,
                display_name: "tester".into(),
                role: Default::default(),
                keep_open: false,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_creates_room() {
        let server = Broadcaster::listen(test_config()).await.unwrap();
        let mut stream = connect(&server).await;

        send(&mut stream, join("shot-010", RoomProtocol::Generic)).await;
        let reply = recv(&mut stream).await;
        assert_eq!(reply.opcode, Opcode::RoomState);

        let state: RoomState = reply.decode().unwrap();
        assert_eq!(state.last_sequence, 0);
        assert!(state.snapshot.is_some());

        let rooms = server.rooms().await;
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].status, RoomStatus::Open);
    }

    #[tokio::test]
    async fn test_second_join_rejected_but_connection_survives() {
        let server = Broadcaster::listen(test_config()).await.unwrap();
        let mut stream = connect(&server).await;

        send(&mut stream, join("a", RoomProtocol::Vrtist)).await;
        recv(&mut stream).await;
        send(&mut stream, join("b", RoomProtocol::Vrtist)).await;

        let reply = recv(&mut stream).await;
        assert_eq!(reply.opcode, Opcode::Error);
        let err: ErrorReply = reply.decode().unwrap();
        assert_eq!(err.code, ErrorCode::AlreadyJoined);

        send(&mut stream, Command::empty(Opcode::Heartbeat)).await;
        assert_eq!(recv(&mut stream).await.opcode, Opcode::Heartbeat);
    }

    #[tokio::test]
    async fn test_relay_before_join_rejected() {
        let server = Broadcaster::listen(test_config()).await.unwrap();
        let mut stream = connect(&server).await;

        send(&mut stream, Command::new(Opcode::BlobUpdate, vec![1])).await;
        let err: ErrorReply = recv(&mut stream).await.decode().unwrap();
        assert_eq!(err.code, ErrorCode::NotJoined);
    }

    #[tokio::test]
    async fn test_delete_room_requires_idle() {
        let server = Broadcaster::listen(test_config()).await.unwrap();
        let mut a = connect(&server).await;
        let mut b = connect(&server).await;

        send(&mut a, join("shot", RoomProtocol::Vrtist)).await;
        recv(&mut a).await;

        let delete = Command::json(Opcode::DeleteRoom, &DeleteRoom { room: "shot".into() }).unwrap();
        send(&mut b, delete.clone()).await;
        let err: ErrorReply = recv(&mut b).await.decode().unwrap();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        send(&mut a, Command::empty(Opcode::LeaveRoom)).await;
        // LEAVE_ROOM has no reply; a listing confirms the room went idle
        send(&mut a, Command::empty(Opcode::ListRooms)).await;
        let rooms: Vec<RoomInfo> = recv(&mut a).await.decode().unwrap();
        assert_eq!(rooms[0].status, RoomStatus::Idle);

        send(&mut b, delete).await;
        assert_eq!(recv(&mut b).await.opcode, Opcode::DeleteRoom);
        assert!(server.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_rename_shows_in_listing() {
        let server = Broadcaster::listen(test_config()).await.unwrap();
        let mut stream = connect(&server).await;

        send(
            &mut stream,
            Command::json(Opcode::SetClientName, &SetClientName { name: "ana".into() }).unwrap(),
        )
        .await;
        send(&mut stream, Command::empty(Opcode::ListClients)).await;

        let clients: Vec<ClientInfo> = recv(&mut stream).await.decode().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "ana");
        assert_eq!(clients[0].room, None);
    }
}
