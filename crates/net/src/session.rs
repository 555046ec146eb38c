//! Client session state machine
//!
//! `Connecting -> Handshaking -> Joined -> Active -> Disconnecting -> Closed`.
//! `Joined -> Active` happens once ROOM_STATE has been handed to the
//! session's outbound queue. `LEAVE_ROOM` returns an `Active` session to
//! `Handshaking`. Any transport error moves straight to `Closed`.

use crate::error::{Error, Result};
use crate::protocol::{ClientId, ClientInfo, SessionRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Joined,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Joined) => true,
            (Joined, Active) => true,
            (Active, Handshaking) => true,
            (Handshaking | Joined | Active, Disconnecting) => true,
            _ => false,
        }
    }
}

/// Server-side record of one connection
#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    pub name: String,
    pub role: SessionRole,
    pub room: Option<String>,
    pub last_acked_sequence: u64,
    state: SessionState,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            name: format!("client-{}", id),
            role: SessionRole::default(),
            room: None,
            last_acked_sequence: 0,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::InvalidTransition(format!(
                "{:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            name: self.name.clone(),
            room: self.room.clone(),
            role: self.role,
            last_acked_sequence: self.last_acked_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut session = ClientSession::new(ClientId(1));
        for next in [
            SessionState::Handshaking,
            SessionState::Joined,
            SessionState::Active,
            SessionState::Disconnecting,
            SessionState::Closed,
        ] {
            session.transition(next).unwrap();
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_leave_returns_to_handshaking() {
        let mut session = ClientSession::new(ClientId(1));
        session.transition(SessionState::Handshaking).unwrap();
        session.transition(SessionState::Joined).unwrap();
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Handshaking).unwrap();
        session.transition(SessionState::Joined).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session = ClientSession::new(ClientId(1));
        assert!(session.transition(SessionState::Active).is_err());

        session.transition(SessionState::Closed).unwrap();
        assert!(matches!(
            session.transition(SessionState::Handshaking),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_info_reports_role_and_progress() {
        let mut session = ClientSession::new(ClientId(4));
        session.role = SessionRole::Receiver;
        session.room = Some("shot".into());
        session.last_acked_sequence = 12;

        let info = session.info();
        assert_eq!(info.name, "client-4");
        assert_eq!(info.role, SessionRole::Receiver);
        assert_eq!(info.last_acked_sequence, 12);
        assert_eq!(info.room.as_deref(), Some("shot"));
    }

    #[test]
    fn test_transport_error_closes_from_any_state() {
        for state in [
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Joined,
            SessionState::Active,
            SessionState::Disconnecting,
        ] {
            assert!(state.can_transition(SessionState::Closed));
        }
    }
}
