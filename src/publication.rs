//! The publication bus: the engine's only way of talking back to libraries
//! and the replicated log.
//!
//! Every `save_*` call returns a position. A positive position means the
//! record was appended; `BACK_PRESSURED` means the downstream buffer was
//! full and the caller must retry without advancing its state machine.

use bytes::Bytes;
use crossbeam::channel::{Sender, TrySendError};

use crate::messages::{
    ConnectionType, GatewayError, GatewayEvent, LogonStatus, SessionInfo, SessionReplyStatus,
    SessionState,
};

/// Soft failure: the downstream buffer is full, retry on a later tick.
pub const BACK_PRESSURED: i64 = -1;

#[allow(clippy::too_many_arguments)]
pub trait GatewayPublication: Send {
    fn save_manage_connection(
        &mut self,
        connection_id: u64,
        session_id: i64,
        address: &str,
        library_id: i32,
        connection_type: ConnectionType,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        state: SessionState,
        heartbeat_interval_s: u32,
        reply_to_id: i64,
    ) -> i64;

    fn save_logon(
        &mut self,
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        sender_comp_id: &str,
        sender_sub_id: Option<&str>,
        sender_location_id: Option<&str>,
        target_comp_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        status: LogonStatus,
    ) -> i64;

    fn save_error(
        &mut self,
        error: GatewayError,
        library_id: i32,
        reply_to_id: i64,
        message: &str,
    ) -> i64;

    fn save_release_session_reply(
        &mut self,
        status: SessionReplyStatus,
        correlation_id: i64,
    ) -> i64;

    fn save_request_session_reply(
        &mut self,
        status: SessionReplyStatus,
        correlation_id: i64,
    ) -> i64;

    fn save_application_heartbeat(&mut self, library_id: i32) -> i64;

    fn save_control_notification(&mut self, library_id: i32, sessions: &[SessionInfo]) -> i64;

    fn save_library_timeout(&mut self, library_id: i32, connect_correlation_id: i64) -> i64;

    fn save_message(
        &mut self,
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        msg_type: &str,
        body: Bytes,
    ) -> i64;
}

/// Solo-mode bus over a bounded in-process channel.
///
/// A full channel is the real source of `BACK_PRESSURED` here; a hung-up
/// consumer is treated as "nobody left to notify" so shutdown never
/// livelocks on retries.
pub struct InProcessPublication {
    tx: Sender<GatewayEvent>,
    position: i64,
}

impl InProcessPublication {
    pub fn new(tx: Sender<GatewayEvent>) -> Self {
        Self { tx, position: 0 }
    }

    fn offer(&mut self, event: GatewayEvent) -> i64 {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.position += 1;
                self.position
            }
            Err(TrySendError::Full(_)) => BACK_PRESSURED,
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("publication consumer gone; dropping event");
                self.position += 1;
                self.position
            }
        }
    }
}

impl GatewayPublication for InProcessPublication {
    fn save_manage_connection(
        &mut self,
        connection_id: u64,
        session_id: i64,
        address: &str,
        library_id: i32,
        connection_type: ConnectionType,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        state: SessionState,
        heartbeat_interval_s: u32,
        reply_to_id: i64,
    ) -> i64 {
        self.offer(GatewayEvent::ManageConnection {
            connection_id,
            session_id,
            address: address.to_string(),
            library_id,
            connection_type,
            last_sent_sequence_number,
            last_received_sequence_number,
            state,
            heartbeat_interval_s,
            reply_to_id,
        })
    }

    fn save_logon(
        &mut self,
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        sender_comp_id: &str,
        sender_sub_id: Option<&str>,
        sender_location_id: Option<&str>,
        target_comp_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        status: LogonStatus,
    ) -> i64 {
        self.offer(GatewayEvent::Logon {
            library_id,
            connection_id,
            session_id,
            last_sent_sequence_number,
            last_received_sequence_number,
            sender_comp_id: sender_comp_id.to_string(),
            sender_sub_id: sender_sub_id.map(str::to_string),
            sender_location_id: sender_location_id.map(str::to_string),
            target_comp_id: target_comp_id.to_string(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            status,
        })
    }

    fn save_error(
        &mut self,
        error: GatewayError,
        library_id: i32,
        reply_to_id: i64,
        message: &str,
    ) -> i64 {
        self.offer(GatewayEvent::Error {
            error,
            library_id,
            reply_to_id,
            message: message.to_string(),
        })
    }

    fn save_release_session_reply(
        &mut self,
        status: SessionReplyStatus,
        correlation_id: i64,
    ) -> i64 {
        self.offer(GatewayEvent::ReleaseSessionReply {
            status,
            correlation_id,
        })
    }

    fn save_request_session_reply(
        &mut self,
        status: SessionReplyStatus,
        correlation_id: i64,
    ) -> i64 {
        self.offer(GatewayEvent::RequestSessionReply {
            status,
            correlation_id,
        })
    }

    fn save_application_heartbeat(&mut self, library_id: i32) -> i64 {
        self.offer(GatewayEvent::ApplicationHeartbeat { library_id })
    }

    fn save_control_notification(&mut self, library_id: i32, sessions: &[SessionInfo]) -> i64 {
        self.offer(GatewayEvent::ControlNotification {
            library_id,
            sessions: sessions.to_vec(),
        })
    }

    fn save_library_timeout(&mut self, library_id: i32, connect_correlation_id: i64) -> i64 {
        self.offer(GatewayEvent::LibraryTimeout {
            library_id,
            connect_correlation_id,
        })
    }

    fn save_message(
        &mut self,
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        msg_type: &str,
        body: Bytes,
    ) -> i64 {
        self.offer(GatewayEvent::Message {
            library_id,
            connection_id,
            session_id,
            msg_type: msg_type.to_string(),
            body,
        })
    }
}
