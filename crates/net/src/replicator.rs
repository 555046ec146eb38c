//! Client-side glue between [`ClientEvent`]s and the local scene
//!
//! [`GenericReplicator`] feeds SCENE_DIFF traffic through a [`SyncEngine`];
//! [`VrtistReplicator`] decodes BLOB_UPDATE payloads straight into a
//! [`VrtistSink`].

use std::sync::atomic::AtomicBool;

use mixer_core::{
    apply_blob, ApplyReport, DiffSet, Revision, SceneAdapter, SyncEngine, TransformCoalescer,
    VrtistMessage, VrtistSink,
};
use tracing::{debug, warn};

use crate::client::{Client, ClientEvent};
use crate::error::Result;
use crate::protocol::{Command, Opcode, RoomState};

/// Keeps a host scene in sync with a Generic room
pub struct GenericReplicator<S: SceneAdapter> {
    engine: SyncEngine,
    scene: S,
}

impl<S: SceneAdapter> GenericReplicator<S> {
    pub fn new(scene: S) -> Self {
        Self {
            engine: SyncEngine::new(),
            scene,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    /// Local edits go here; call [`flush`](Self::flush) to publish them
    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    /// Diff the scene against the shadow tree and send the result
    pub async fn flush(&mut self, client: &Client) -> Result<Option<DiffSet>> {
        let Some(diff) = self.engine.capture_local(&self.scene)? else {
            return Ok(None);
        };
        client.send_diff(&diff).await?;
        Ok(Some(diff))
    }

    /// Fold one client event into the scene
    pub fn handle_event(&mut self, event: &ClientEvent) -> Result<Option<ApplyReport>> {
        self.handle_event_cancellable(event, &AtomicBool::new(false))
    }

    /// Like [`handle_event`](Self::handle_event); a large remote diff stops
    /// between entries once `cancel` is set
    pub fn handle_event_cancellable(
        &mut self,
        event: &ClientEvent,
        cancel: &AtomicBool,
    ) -> Result<Option<ApplyReport>> {
        match event {
            ClientEvent::RoomJoined(state) => {
                self.load_state(state)?;
                Ok(None)
            }
            ClientEvent::Committed(cmd) if cmd.opcode == Opcode::SceneDiff => {
                let Some(sequence) = cmd.sequence else {
                    return Ok(None);
                };
                let diff = DiffSet::from_bytes(&cmd.payload)?;
                let report = self.engine.apply_remote_cancellable(
                    &diff,
                    Revision(sequence),
                    &mut self.scene,
                    cancel,
                );
                debug!(
                    sequence,
                    applied = report.applied,
                    stale = report.stale,
                    skipped = report.skipped.len(),
                    "Applied remote diff"
                );
                Ok(Some(report))
            }
            ClientEvent::Acknowledged {
                opcode: Opcode::SceneDiff,
                sequence,
            } => {
                if self.engine.acknowledge(Revision(*sequence)).is_none() {
                    warn!(sequence, "Ack without a pending local diff");
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn load_state(&mut self, state: &RoomState) -> Result<()> {
        let covered = match &state.snapshot {
            Some(snapshot) => {
                self.engine.load_snapshot(snapshot, &mut self.scene)?;
                snapshot.sequence
            }
            None => 0,
        };

        // Anything the snapshot already covers is stale and skipped anyway
        for cmd in replayed(state, Opcode::SceneDiff).filter(|c| c.sequence > Some(covered)) {
            let Some(sequence) = cmd.sequence else {
                continue;
            };
            match DiffSet::from_bytes(&cmd.payload) {
                Ok(diff) => {
                    self.engine
                        .apply_remote(&diff, Revision(sequence), &mut self.scene);
                }
                Err(e) => warn!(sequence, error = %e, "Skipping undecodable replayed diff"),
            }
        }
        Ok(())
    }
}

/// Drives a [`VrtistSink`] from a VRtist room
pub struct VrtistReplicator<K: VrtistSink> {
    sink: K,
    outgoing: TransformCoalescer,
    room: Option<String>,
    /// Highest sequence already reflected in the sink
    applied: u64,
}

impl<K: VrtistSink> VrtistReplicator<K> {
    pub fn new(sink: K) -> Self {
        Self {
            sink,
            outgoing: TransformCoalescer::new(),
            room: None,
            applied: 0,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Queue a local change; transforms of the same object collapse
    pub fn push(&mut self, message: VrtistMessage) {
        self.outgoing.push(message);
    }

    /// Send everything queued since the last flush
    pub async fn flush(&mut self, client: &Client) -> Result<usize> {
        let blobs = self.outgoing.drain();
        let count = blobs.len();
        for blob in blobs {
            client.send_blob(blob).await?;
        }
        Ok(count)
    }

    pub fn handle_event(&mut self, event: &ClientEvent) -> Result<()> {
        match event {
            ClientEvent::RoomJoined(state) => {
                // A different room, or one recreated since, numbers from scratch
                if self.room.as_deref() != Some(state.room.as_str())
                    || state.last_sequence < self.applied
                {
                    self.room = Some(state.room.clone());
                    self.applied = 0;
                }

                let applied = self.applied;
                for cmd in replayed(state, Opcode::BlobUpdate)
                    .filter(|c| c.sequence.is_some_and(|seq| seq > applied))
                {
                    if let Err(e) = apply_blob(&cmd.payload, &mut self.sink) {
                        warn!(sequence = ?cmd.sequence, error = %e, "Skipping replayed blob");
                    }
                }
                self.applied = state.last_sequence;
                Ok(())
            }
            ClientEvent::Committed(cmd) if cmd.opcode == Opcode::BlobUpdate => {
                let sequence = cmd.sequence.unwrap_or_default();
                if sequence != 0 && sequence <= self.applied {
                    debug!(sequence, "Blob already applied");
                    return Ok(());
                }
                self.applied = self.applied.max(sequence);
                apply_blob(&cmd.payload, &mut self.sink)?;
                Ok(())
            }
            ClientEvent::Acknowledged {
                opcode: Opcode::BlobUpdate,
                sequence,
            } => {
                // Our own change is already in the sink
                self.applied = self.applied.max(*sequence);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn replayed(state: &RoomState, opcode: Opcode) -> impl Iterator<Item = &Command> {
    state.replay.iter().filter(move |c| c.opcode == opcode)
}
