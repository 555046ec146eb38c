//! Mixer Network Library
//!
//! TCP relay for collaborative scene editing.
//!
//! # Architecture
//!
//! - **Broadcaster**: accepts connections and routes them into named rooms
//! - **Room**: per-room sequencer, replay buffer and advisory locks
//! - **Client**: connection handle with heartbeats and gap detection
//! - **Protocol**: length-prefixed binary frames, JSON control payloads
//!
//! # Usage
//!
//! ```ignore
//! let server = Broadcaster::listen(BroadcasterConfig::default()).await?;
//!
//! let mut client = Client::connect(server.addr()).await?;
//! client.join_room("shot-010", RoomProtocol::Generic, "ana").await?;
//!
//! let mut replicator = GenericReplicator::new(MemoryScene::new());
//! while let Some(event) = client.next_event().await {
//!     replicator.handle_event(&event)?;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod locks;
pub mod protocol;
pub mod replicator;
pub mod room;
pub mod server;
pub mod session;

pub use client::{Client, ClientConfig, ClientEvent, ConnectionState};
pub use config::{BroadcasterConfig, ConfigError};
pub use error::{Error, Result};
pub use locks::LockTable;
pub use protocol::{ClientId, ClientInfo, Command, ErrorCode, Opcode, RoomInfo, RoomProtocol};
pub use replicator::{GenericReplicator, VrtistReplicator};
pub use server::Broadcaster;
pub use session::{ClientSession, SessionState};

/// Default port for broadcaster servers
pub const DEFAULT_PORT: u16 = 12800;
