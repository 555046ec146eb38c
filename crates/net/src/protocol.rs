//! Wire protocol types
//!
//! Every frame carries one [`Command`]. Structured payloads are JSON; relayed
//! payloads (scene diffs, VRtist blobs) are opaque bytes to the server.

use std::fmt;

use chrono::{DateTime, Utc};
use mixer_core::SceneSnapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message kind, the first byte after the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Opcode {
    JoinRoom = 1,
    RoomState = 2,
    ClientJoined = 3,
    ClientLeft = 4,
    LeaveRoom = 5,
    SceneDiff = 6,
    BlobUpdate = 7,
    Heartbeat = 8,
    RequestLock = 9,
    ReleaseLock = 10,
    LockReleased = 11,
    Error = 12,
    CommandAck = 13,
    RequestState = 14,
    ListRooms = 15,
    ListClients = 16,
    SetClientName = 17,
    DeleteRoom = 18,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            1 => JoinRoom,
            2 => RoomState,
            3 => ClientJoined,
            4 => ClientLeft,
            5 => LeaveRoom,
            6 => SceneDiff,
            7 => BlobUpdate,
            8 => Heartbeat,
            9 => RequestLock,
            10 => ReleaseLock,
            11 => LockReleased,
            12 => Error,
            13 => CommandAck,
            14 => RequestState,
            15 => ListRooms,
            16 => ListClients,
            17 => SetClientName,
            18 => DeleteRoom,
            _ => return None,
        })
    }

    /// Commands the room sequences and fans out without interpretation
    pub fn is_relayed(self) -> bool {
        matches!(
            self,
            Opcode::SceneDiff | Opcode::BlobUpdate | Opcode::RequestLock | Opcode::ReleaseLock
        )
    }

    /// Commands only the server may emit
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            Opcode::RoomState
                | Opcode::ClientJoined
                | Opcode::ClientLeft
                | Opcode::LockReleased
                | Opcode::Error
                | Opcode::CommandAck
        )
    }
}

/// Server-assigned numeric client id; 0 is the server itself
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room protocol kind, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomProtocol {
    Generic,
    Vrtist,
}

impl fmt::Display for RoomProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomProtocol::Generic => write!(f, "generic"),
            RoomProtocol::Vrtist => write!(f, "vrtist"),
        }
    }
}

/// Declared session role; both roles are treated the same
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    #[default]
    Sender,
    Receiver,
}

/// One unit of relayed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub opcode: Opcode,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Originating client, [`ClientId::SERVER`] for server notifications
    pub origin: ClientId,
    /// Room sequence number, absent until committed
    pub sequence: Option<u64>,
    /// Diagnostic only, never used for ordering
    pub emitted_at: DateTime<Utc>,
}

impl Command {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            origin: ClientId::SERVER,
            sequence: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self::new(opcode, Vec::new())
    }

    /// Command with a JSON payload
    pub fn json<T: Serialize>(opcode: Opcode, body: &T) -> Result<Self> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(opcode, payload))
    }

    /// Decode the JSON payload; an undecodable payload is a malformed frame
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            Error::MalformedFrame(format!("invalid {:?} payload: {}", self.opcode, e))
        })
    }

    pub fn with_origin(mut self, origin: ClientId) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Information about a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub role: SessionRole,
    /// Last sequence the client reported through HEARTBEAT
    #[serde(default)]
    pub last_acked_sequence: u64,
}

/// JOIN_ROOM payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoom {
    pub room: String,
    pub protocol: RoomProtocol,
    pub display_name: String,
    #[serde(default)]
    pub role: SessionRole,
    /// Keep the room alive while empty
    #[serde(default)]
    pub keep_open: bool,
}

/// Current holder of an advisory lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub resource: String,
    pub holder: ClientId,
}

/// ROOM_STATE payload: everything a joiner needs to catch up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub room: String,
    pub protocol: RoomProtocol,
    /// Id assigned to the receiving client
    pub client_id: ClientId,
    /// Last committed sequence number; live traffic continues after it
    pub last_sequence: u64,
    pub members: Vec<ClientInfo>,
    /// Most recent committed commands, oldest first
    pub replay: Vec<Command>,
    /// Live Data Proxies (Generic rooms only)
    #[serde(default)]
    pub snapshot: Option<SceneSnapshot>,
    #[serde(default)]
    pub locks: Vec<LockHolder>,
}

/// REQUEST_LOCK / RELEASE_LOCK payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: String,
}

/// LOCK_RELEASED payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReleased {
    pub resource: String,
    pub holder: ClientId,
}

/// HEARTBEAT payload; clients report how far they have caught up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub last_sequence: u64,
    /// Cadence the server expects, set on echoes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

/// COMMAND_ACK payload; the frame's sequence is the committed number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub opcode: Opcode,
}

/// SET_CLIENT_NAME payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetClientName {
    pub name: String,
}

/// DELETE_ROOM payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRoom {
    pub room: String,
}

/// Room lifecycle state as reported in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Created,
    Open,
    Idle,
    Closed,
}

/// LIST_ROOMS entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub protocol: RoomProtocol,
    pub members: usize,
    pub status: RoomStatus,
    pub next_sequence: u64,
    pub keep_open: bool,
}

/// Reason codes carried by ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolMismatch,
    AlreadyJoined,
    NotJoined,
    MalformedFrame,
    RoomNotFound,
    InvalidRequest,
}

/// ERROR payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

/// Raw bytes as base64 strings inside JSON
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
