//! Room and room sequencer
//!
//! A room is the single ordering authority for its members. Sequence
//! allocation, replay append and fan-out all happen while the caller holds
//! the room's lock, and fan-out never waits: each member has a bounded
//! outbound queue and a member whose queue is full is evicted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mixer_core::{DiffSet, NullScene, Replica, Revision};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::locks::LockTable;
use crate::protocol::{
    ClientId, ClientInfo, Command, CommandAck, LockReleased, LockRequest, Opcode, RoomInfo,
    RoomProtocol, RoomState, RoomStatus,
};

/// Handle to one session's outbound queue
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Command>,
    closer: Arc<Notify>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Command>, closer: Arc<Notify>) -> Self {
        Self { tx, closer }
    }

    /// Queue without waiting; false if the queue is full or gone
    pub fn push(&self, cmd: Command) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the owning connection to shut down
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

#[derive(Debug)]
struct Member {
    info: ClientInfo,
    outbound: Outbound,
}

#[derive(Debug)]
pub struct Room {
    name: String,
    protocol: RoomProtocol,
    status: RoomStatus,
    idle_since: Option<Instant>,
    keep_open: bool,
    members: Vec<Member>,
    next_sequence: u64,
    replay: VecDeque<Command>,
    replay_capacity: usize,
    /// ROOM_STATE has to fit in one frame of this size
    max_frame_size: u32,
    locks: LockTable,
    /// Committed scene of a Generic room
    replica: Option<Replica>,
}

impl Room {
    pub fn new(name: &str, protocol: RoomProtocol, replay_capacity: usize) -> Self {
        info!(room = %name, protocol = %protocol, "Room created");
        Self {
            name: name.to_string(),
            protocol,
            status: RoomStatus::Created,
            idle_since: None,
            keep_open: false,
            members: Vec::new(),
            next_sequence: 1,
            replay: VecDeque::with_capacity(replay_capacity.min(1024)),
            replay_capacity: replay_capacity.max(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            locks: LockTable::new(),
            replica: (protocol == RoomProtocol::Generic).then(Replica::new),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> RoomProtocol {
        self.protocol
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn keep_open(&self) -> bool {
        self.keep_open
    }

    pub fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_member(&self, id: ClientId) -> bool {
        self.members.iter().any(|m| m.info.id == id)
    }

    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members.iter().map(|m| m.info.id).collect()
    }

    /// Last committed sequence number, 0 before the first commit
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn replica(&self) -> Option<&Replica> {
        self.replica.as_ref()
    }

    /// Add a member: it gets ROOM_STATE, the others get CLIENT_JOINED
    pub fn admit(
        &mut self,
        info: ClientInfo,
        protocol: RoomProtocol,
        outbound: Outbound,
    ) -> Result<()> {
        if self.status == RoomStatus::Closed {
            return Err(Error::RoomNotFound(self.name.clone()));
        }
        if protocol != self.protocol {
            return Err(Error::ProtocolMismatch {
                room: self.name.clone(),
                existing: self.protocol,
                requested: protocol,
            });
        }
        if self.is_member(info.id) {
            return Err(Error::AlreadyJoined(self.name.clone()));
        }

        let id = info.id;
        let state = self.state_command(id)?;
        if !outbound.push(state) {
            outbound.close();
            return Err(Error::ConnectionClosed);
        }

        let joined = Command::json(Opcode::ClientJoined, &info)?;
        let failed = self.fan_out(&joined, None);

        self.members.push(Member { info, outbound });
        self.status = RoomStatus::Open;
        self.idle_since = None;
        info!(room = %self.name, client_id = %id, members = self.members.len(), "Client joined room");

        self.evict(failed);
        Ok(())
    }

    /// Sequence a relayed command, fan it out and ack the sender
    pub fn relay(&mut self, mut cmd: Command, origin: ClientId) -> Result<u64> {
        if !self.is_member(origin) {
            return Err(Error::NotJoined);
        }
        if !cmd.opcode.is_relayed() {
            return Err(Error::InvalidRequest(format!(
                "{:?} is not a relayed command",
                cmd.opcode
            )));
        }

        // Lock commands are the only relayed payloads the server reads
        let lock = match cmd.opcode {
            Opcode::RequestLock | Opcode::ReleaseLock => Some(
                cmd.decode::<LockRequest>()
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?,
            ),
            _ => None,
        };

        let sequence = self.commit(&mut cmd, origin);

        match (cmd.opcode, lock) {
            (Opcode::RequestLock, Some(req)) => {
                if self.locks.request(&req.resource, origin) {
                    debug!(room = %self.name, resource = %req.resource, holder = %origin, "Lock granted");
                }
            }
            (Opcode::ReleaseLock, Some(req)) => {
                self.locks.release(&req.resource, origin);
            }
            (Opcode::SceneDiff, _) => self.fold_diff(&cmd.payload, sequence),
            _ => {}
        }

        let mut failed = self.fan_out(&cmd, Some(origin));

        let ack = Command::json(
            Opcode::CommandAck,
            &CommandAck {
                opcode: cmd.opcode,
            },
        )?
        .with_sequence(sequence);
        if let Some(sender) = self.members.iter().find(|m| m.info.id == origin) {
            if !sender.outbound.push(ack) {
                failed.push(origin);
            }
        }

        self.evict(failed);
        Ok(sequence)
    }

    /// Remove a member. Returns false if it was not in the room.
    pub fn depart(&mut self, id: ClientId) -> bool {
        if self.take_member(id).is_none() {
            return false;
        }
        info!(room = %self.name, client_id = %id, members = self.members.len(), "Client left room");
        let failed = self.announce_departure(id);
        self.evict(failed);
        true
    }

    /// Queue a fresh ROOM_STATE for an existing member
    pub fn resend_state(&mut self, id: ClientId) -> Result<()> {
        if !self.is_member(id) {
            return Err(Error::NotJoined);
        }
        let state = self.state_command(id)?;
        let delivered = self
            .members
            .iter()
            .find(|m| m.info.id == id)
            .map(|m| m.outbound.push(state))
            .ok_or(Error::NotJoined)?;
        if !delivered {
            self.evict(vec![id]);
        }
        Ok(())
    }

    pub fn rename(&mut self, id: ClientId, name: &str) {
        if let Some(member) = self.members.iter_mut().find(|m| m.info.id == id) {
            member.info.name = name.to_string();
        }
    }

    pub fn state_for(&self, client_id: ClientId) -> RoomState {
        let last_sequence = self.last_sequence();
        RoomState {
            room: self.name.clone(),
            protocol: self.protocol,
            client_id,
            last_sequence,
            members: self.members.iter().map(|m| m.info.clone()).collect(),
            replay: self.replay.iter().cloned().collect(),
            snapshot: self.replica.as_ref().map(|r| r.snapshot(last_sequence)),
            locks: self.locks.holders(),
        }
    }

    /// ROOM_STATE for `client_id`, dropping the oldest replayed commands
    /// until it fits in one frame
    pub fn state_command(&self, client_id: ClientId) -> Result<Command> {
        let budget = (self.max_frame_size as usize).saturating_sub(HEADER_SIZE);
        let mut state = self.state_for(client_id);
        let replay = std::mem::take(&mut state.replay);

        let mut used = serde_json::to_vec(&state)?.len();
        if used > budget {
            return Err(Error::StateTooLarge {
                room: self.name.clone(),
                size: used,
                limit: budget,
            });
        }

        let mut keep = 0;
        for cmd in replay.iter().rev() {
            // One extra byte for the separating comma
            let size = serde_json::to_vec(cmd)?.len() + 1;
            if used + size > budget {
                break;
            }
            used += size;
            keep += 1;
        }
        if keep < replay.len() {
            warn!(
                room = %self.name,
                client_id = %client_id,
                dropped = replay.len() - keep,
                "Replay trimmed to fit ROOM_STATE frame"
            );
        }

        let skip = replay.len() - keep;
        state.replay = replay.into_iter().skip(skip).collect();
        Command::json(Opcode::RoomState, &state)
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            name: self.name.clone(),
            protocol: self.protocol,
            members: self.members.len(),
            status: self.status,
            next_sequence: self.next_sequence,
            keep_open: self.keep_open,
        }
    }

    /// Idle past the grace window and not kept open
    pub fn is_expired(&self, grace: Duration, now: Instant) -> bool {
        if self.status != RoomStatus::Idle || self.keep_open {
            return false;
        }
        self.idle_since
            .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    pub fn close(&mut self) {
        for member in self.members.drain(..) {
            member.outbound.close();
        }
        self.status = RoomStatus::Closed;
        info!(room = %self.name, last_sequence = self.last_sequence(), "Room closed");
    }

    fn commit(&mut self, cmd: &mut Command, origin: ClientId) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        cmd.origin = origin;
        cmd.sequence = Some(sequence);

        if self.replay.len() >= self.replay_capacity {
            self.replay.pop_front();
        }
        self.replay.push_back(cmd.clone());

        // Joiners only replay what the snapshot does not cover, so deletions
        // older than the whole buffer need no tombstone
        if let (Some(replica), Some(oldest)) = (
            self.replica.as_mut(),
            self.replay.front().and_then(|c| c.sequence),
        ) {
            replica.prune_tombstones(Revision(oldest));
        }
        sequence
    }

    fn fold_diff(&mut self, payload: &[u8], sequence: u64) {
        let Some(replica) = self.replica.as_mut() else {
            return;
        };
        match DiffSet::from_bytes(payload) {
            Ok(diff) => {
                let report = replica.apply(&diff, Revision(sequence), &mut NullScene);
                if !report.skipped.is_empty() {
                    debug!(room = %self.name, sequence, skipped = report.skipped.len(), "Diff entries skipped in room snapshot");
                }
            }
            Err(e) => {
                warn!(room = %self.name, sequence, error = %e, "Undecodable scene diff relayed as-is");
            }
        }
    }

    /// Push to every member except `except`; returns members that could not
    /// take it
    fn fan_out(&self, cmd: &Command, except: Option<ClientId>) -> Vec<ClientId> {
        self.members
            .iter()
            .filter(|m| Some(m.info.id) != except)
            .filter(|m| !m.outbound.push(cmd.clone()))
            .map(|m| m.info.id)
            .collect()
    }

    fn take_member(&mut self, id: ClientId) -> Option<Member> {
        let index = self.members.iter().position(|m| m.info.id == id)?;
        let member = self.members.remove(index);
        if self.members.is_empty() {
            self.status = RoomStatus::Idle;
            self.idle_since = Some(Instant::now());
        }
        Some(member)
    }

    /// CLIENT_LEFT plus one LOCK_RELEASED per lock the client held
    fn announce_departure(&mut self, id: ClientId) -> Vec<ClientId> {
        let mut failed = Vec::new();

        match Command::json(Opcode::ClientLeft, &id) {
            Ok(left) => failed.extend(self.fan_out(&left, None)),
            Err(e) => warn!(error = %e, "Failed to encode CLIENT_LEFT"),
        }

        for resource in self.locks.release_all(id) {
            let released = LockReleased {
                resource,
                holder: id,
            };
            match Command::json(Opcode::LockReleased, &released) {
                Ok(mut cmd) => {
                    self.commit(&mut cmd, ClientId::SERVER);
                    debug!(room = %self.name, resource = %released.resource, "Lock released on departure");
                    failed.extend(self.fan_out(&cmd, None));
                }
                Err(e) => warn!(error = %e, "Failed to encode LOCK_RELEASED"),
            }
        }

        failed
    }

    /// Drop members whose queues overflowed, cascading their departures
    fn evict(&mut self, mut failed: Vec<ClientId>) {
        while let Some(id) = failed.pop() {
            if let Some(member) = self.take_member(id) {
                warn!(room = %self.name, client_id = %id, "Outbound queue full, evicting client");
                member.outbound.close();
                failed.extend(self.announce_departure(id));
            }
        }
    }
}
