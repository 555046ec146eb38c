//! Network error types

use std::io;

use crate::config::ConfigError;
use crate::protocol::{ErrorCode, RoomProtocol};

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Room '{room}' uses the {existing} protocol, not {requested}")]
    ProtocolMismatch {
        room: String,
        existing: RoomProtocol,
        requested: RoomProtocol,
    },

    #[error("Already joined room '{0}'")]
    AlreadyJoined(String),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State of room '{room}' needs {size} bytes, frame limit is {limit}")]
    StateTooLarge {
        room: String,
        size: usize,
        limit: usize,
    },

    #[error("Session timed out")]
    SessionTimeout,

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] mixer_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wire code reported to the peer, if this error is reportable
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::MalformedFrame(_) => Some(ErrorCode::MalformedFrame),
            Error::ProtocolMismatch { .. } => Some(ErrorCode::ProtocolMismatch),
            Error::AlreadyJoined(_) => Some(ErrorCode::AlreadyJoined),
            Error::NotJoined => Some(ErrorCode::NotJoined),
            Error::RoomNotFound(_) => Some(ErrorCode::RoomNotFound),
            Error::InvalidRequest(_)
            | Error::InvalidTransition(_)
            | Error::StateTooLarge { .. } => Some(ErrorCode::InvalidRequest),
            _ => None,
        }
    }

    /// Errors that end the connection rather than being reported
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::MalformedFrame(_)
                | Error::SessionTimeout
        )
    }
}
