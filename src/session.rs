//! Gateway sessions: FIX sessions currently owned by the engine.
//!
//! A session lands here when an accepted connection completes (or is still
//! completing) logon, when a library releases a session back, or when a
//! library times out and its connections are reclaimed. It leaves on
//! hand-off to a library or on disconnect.

use std::collections::HashMap;
use std::fmt;

use crate::messages::{ConnectionType, SessionInfo, SessionState, UNKNOWN_SESSION};

/// Identity of a FIX session across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub qualifier: Option<String>,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender_comp_id, self.target_comp_id)?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, ":{}", qualifier)?;
        }
        Ok(())
    }
}

/// A FIX session owned by the engine.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub connection_id: u64,
    pub session_id: i64,
    pub key: Option<CompositeKey>,
    pub connection_type: ConnectionType,
    pub state: SessionState,
    pub heartbeat_interval_s: u32,
    pub last_sent_sequence_number: i32,
    pub last_received_sequence_number: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Library that owned this session before a timeout reclaim; drives the
    /// `ControlNotification` sent when that library reconnects.
    pub previous_owner: Option<i32>,
    last_receive_ms: u64,
    last_send_ms: u64,
    test_request_outstanding: bool,
    next_sender_seq: u32,
}

impl GatewaySession {
    /// Fresh session for a just-accepted connection: logon not yet seen, so
    /// no key, no id, heartbeat interval unknown.
    pub fn accepted(connection_id: u64, now_ms: u64) -> Self {
        Self::new(connection_id, ConnectionType::Acceptor, now_ms)
    }

    pub fn new(connection_id: u64, connection_type: ConnectionType, now_ms: u64) -> Self {
        Self {
            connection_id,
            session_id: UNKNOWN_SESSION,
            key: None,
            connection_type,
            state: SessionState::Connected,
            heartbeat_interval_s: 0,
            last_sent_sequence_number: 0,
            last_received_sequence_number: 0,
            username: None,
            password: None,
            previous_owner: None,
            last_receive_ms: now_ms,
            last_send_ms: now_ms,
            test_request_outstanding: false,
            next_sender_seq: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.key.as_ref().map(|key| SessionInfo {
            session_id: self.session_id,
            connection_id: self.connection_id,
            key: key.clone(),
        })
    }

    /// Any inbound frame proves liveness and settles an outstanding
    /// test request.
    pub fn on_frame_received(&mut self, now_ms: u64, msg_seq_num: Option<i32>) {
        self.last_receive_ms = now_ms;
        self.test_request_outstanding = false;
        if let Some(seq) = msg_seq_num {
            self.last_received_sequence_number = seq;
        }
    }

    pub fn on_bytes_sent(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    pub fn next_sender_seq(&mut self) -> u32 {
        let seq = self.next_sender_seq;
        self.next_sender_seq += 1;
        self.last_sent_sequence_number = seq as i32;
        seq
    }

    fn restart_schedule(&mut self, now_ms: u64) {
        self.last_receive_ms = now_ms;
        self.last_send_ms = now_ms;
        self.test_request_outstanding = false;
    }
}

/// What the heartbeat sweep wants done to a connection. The framer owns the
/// endpoints, so the registry only names the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendHeartbeat { connection_id: u64 },
    SendTestRequest { connection_id: u64 },
    Disconnect { connection_id: u64 },
}

/// Registry of engine-owned sessions, keyed by connection id.
#[derive(Debug, Default)]
pub struct GatewaySessions {
    sessions: HashMap<u64, GatewaySession>,
}

impl GatewaySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (back) ownership of a session. The heartbeat schedule restarts
    /// from `now_ms` so a reclaimed session never times out on arrival.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        &mut self,
        mut session: GatewaySession,
        state: SessionState,
        heartbeat_interval_s: u32,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        username: Option<String>,
        password: Option<String>,
        now_ms: u64,
    ) {
        session.state = state;
        session.heartbeat_interval_s = heartbeat_interval_s;
        session.last_sent_sequence_number = last_sent_sequence_number;
        session.last_received_sequence_number = last_received_sequence_number;
        if username.is_some() {
            session.username = username;
        }
        if password.is_some() {
            session.password = password;
        }
        session.restart_schedule(now_ms);
        tracing::debug!(
            connection_id = session.connection_id,
            session_id = session.session_id,
            ?state,
            "gateway session acquired"
        );
        self.sessions.insert(session.connection_id, session);
    }

    /// Hand a session out: removes and returns it, if present.
    pub fn release_by_session_id(&mut self, session_id: i64) -> Option<GatewaySession> {
        let connection_id = self
            .sessions
            .values()
            .find(|s| s.session_id == session_id)
            .map(|s| s.connection_id)?;
        self.sessions.remove(&connection_id)
    }

    pub fn remove_by_connection(&mut self, connection_id: u64) -> Option<GatewaySession> {
        self.sessions.remove(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: u64) -> Option<&mut GatewaySession> {
        self.sessions.get_mut(&connection_id)
    }

    pub fn get(&self, connection_id: u64) -> Option<&GatewaySession> {
        self.sessions.get(&connection_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &GatewaySession> {
        self.sessions.values()
    }

    /// Engine-held sessions that have completed logon, for library
    /// notification.
    pub fn authenticated(&self) -> Vec<&GatewaySession> {
        let mut sessions: Vec<&GatewaySession> = self
            .sessions
            .values()
            .filter(|s| s.is_active() && s.key.is_some())
            .collect();
        sessions.sort_by_key(|s| s.connection_id);
        sessions
    }

    /// Sessions reclaimed from `library_id`, for control notification on
    /// its reconnect.
    pub fn previously_owned_by(&self, library_id: i32) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .values()
            .filter(|s| s.previous_owner == Some(library_id))
            .filter_map(GatewaySession::info)
            .collect();
        infos.sort_by_key(|info| info.connection_id);
        infos
    }

    /// Heartbeat sweep. Per active session with a known interval:
    /// nothing sent for an interval => heartbeat; nothing received for two
    /// intervals => one test request; nothing received for three => drop.
    pub fn poll(&mut self, now_ms: u64) -> Vec<HeartbeatAction> {
        let mut actions = Vec::new();
        for session in self.sessions.values_mut() {
            if !session.is_active() || session.heartbeat_interval_s == 0 {
                continue;
            }
            let interval_ms = u64::from(session.heartbeat_interval_s) * 1000;
            let receive_idle = now_ms.saturating_sub(session.last_receive_ms);
            let send_idle = now_ms.saturating_sub(session.last_send_ms);

            if receive_idle >= 3 * interval_ms {
                actions.push(HeartbeatAction::Disconnect {
                    connection_id: session.connection_id,
                });
            } else if receive_idle >= 2 * interval_ms && !session.test_request_outstanding {
                session.test_request_outstanding = true;
                session.last_send_ms = now_ms;
                actions.push(HeartbeatAction::SendTestRequest {
                    connection_id: session.connection_id,
                });
            } else if send_idle >= interval_ms {
                session.last_send_ms = now_ms;
                actions.push(HeartbeatAction::SendHeartbeat {
                    connection_id: session.connection_id,
                });
            }
        }
        actions.sort_by_key(|action| match action {
            HeartbeatAction::SendHeartbeat { connection_id }
            | HeartbeatAction::SendTestRequest { connection_id }
            | HeartbeatAction::Disconnect { connection_id } => *connection_id,
        });
        actions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
