//! Mixer Core Library
//!
//! Scene replication model shared by every collaborating client.
//!
//! # Architecture
//!
//! - **Proxy**: shadow tree of Data Proxies mirroring the editable scene
//! - **Diff**: dependency-ordered Created/Updated/Deleted diff sets
//! - **Sync**: revision-tracked, idempotent application of diff sets
//! - **Scene**: the two-capability seam to the host editor
//! - **VRtist**: opaque transform/mesh blobs for the low-latency protocol

pub mod bytes;
pub mod diff;
pub mod error;
pub mod proxy;
pub mod scene;
pub mod sync;
pub mod vrtist;

pub use diff::{compute_diff, DiffEntry, DiffSet};
pub use error::{Error, Result};
pub use proxy::{Attributes, DataProxy, ProxyId, ProxyTree};
pub use scene::{ChangeKind, MemoryScene, NullScene, SceneAdapter};
pub use sync::{ApplyReport, Replica, Revision, SceneSnapshot, SyncEngine, SyncState};
pub use vrtist::{apply_blob, MeshBlob, TransformCoalescer, VrtistMessage, VrtistSink};
