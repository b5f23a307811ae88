//! Control-plane records exchanged between libraries and the engine.
//!
//! `LibraryCommand` records arrive on the inbound command subscription and
//! are dispatched by the framer; `GatewayEvent` records are what the
//! publication bus carries back out to libraries and the log.

use bytes::Bytes;

use crate::session::CompositeKey;

/// Library id reserved for the engine itself. Connections not handed to any
/// library are owned under this id.
pub const ENGINE_LIBRARY_ID: i32 = 0;

/// `RequestSession` value meaning "no replay wanted".
pub const NO_MESSAGE_REPLAY: i32 = -1;

/// Initial sequence number meaning "look it up in the sequence index".
pub const AUTOMATIC_INITIAL_SEQUENCE_NUMBER: i32 = -1;

/// Session id of a connection that has not yet completed logon.
pub const UNKNOWN_SESSION: i64 = -1;

/// Protocol-level errors signalled to a library via `save_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    /// The command named a library id the engine has never seen connect
    UnknownLibrary,
    /// An outbound TCP connect failed
    UnableToConnect,
    /// The composite session key is already logged on
    DuplicateSession,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote peer closed the connection
    RemoteDisconnect,
    /// A library asked for the disconnect
    ApplicationDisconnect,
    /// The owning library timed out and reclaim failed to keep the session
    LibraryTimeout,
    /// No traffic within the heartbeat window
    Timeout,
    /// Logon was rejected by the authentication strategy
    FailedAuthentication,
    /// Logon for a composite key that is already active
    DuplicateSession,
    /// An i/o error after establishment
    Exception,
    /// The engine is shutting down
    EngineClose,
    /// The peer sent a malformed or unparsable message
    ProtocolError,
}

/// Lifecycle state of a FIX session as tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outbound connect in flight
    Connecting,
    /// TCP established, logon not yet exchanged
    Connected,
    /// Logon complete; session is live
    Active,
    /// Handed back by a library, awaiting re-acquisition bookkeeping
    Released,
}

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Acceptor,
    Initiator,
}

/// Qualifies a published `Logon` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonStatus {
    /// A session this library just initiated or accepted
    New,
    /// An engine-held session being advertised to a connecting library
    LibraryNotification,
}

/// Whether sequence numbers survive reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceNumberType {
    Transient,
    Persistent,
}

/// Status carried on release/request session replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionReplyStatus {
    Ok,
    /// No engine-held session with that id
    UnknownSession,
}

/// Summary of an engine-held or handed-off session, listed in
/// `ControlNotification` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: i64,
    pub connection_id: u64,
    pub key: CompositeKey,
}

/// Everything needed to open an outbound FIX connection on behalf of a
/// library. Kept as one record because it is exactly the payload of the
/// `InitiateConnection` command and stays in flight across back-pressured
/// retries.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub library_id: i32,
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub sender_sub_id: Option<String>,
    pub sender_location_id: Option<String>,
    pub target_comp_id: String,
    pub sequence_number_type: SequenceNumberType,
    pub initial_sequence_number: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heartbeat_interval_s: u32,
    pub correlation_id: i64,
}

impl InitiateRequest {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            sender_comp_id: self.sender_comp_id.clone(),
            target_comp_id: self.target_comp_id.clone(),
            qualifier: self.sender_sub_id.clone(),
        }
    }
}

/// Framed records arriving on the inbound command subscription.
#[derive(Debug, Clone)]
pub enum LibraryCommand {
    LibraryConnect {
        library_id: i32,
        correlation_id: i64,
        aeron_session_id: i32,
    },
    InitiateConnection(Box<InitiateRequest>),
    ReleaseSession {
        library_id: i32,
        connection_id: u64,
        correlation_id: i64,
        state: SessionState,
        heartbeat_interval_ms: u64,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        username: Option<String>,
        password: Option<String>,
    },
    RequestSession {
        library_id: i32,
        session_id: i64,
        correlation_id: i64,
        last_received_sequence_number: i32,
    },
    Disconnect {
        library_id: i32,
        connection_id: u64,
        reason: DisconnectReason,
    },
    ApplicationHeartbeat {
        library_id: i32,
    },
}

/// Records the engine appends to the publication bus.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    ManageConnection {
        connection_id: u64,
        session_id: i64,
        address: String,
        library_id: i32,
        connection_type: ConnectionType,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        state: SessionState,
        heartbeat_interval_s: u32,
        reply_to_id: i64,
    },
    Logon {
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        sender_comp_id: String,
        sender_sub_id: Option<String>,
        sender_location_id: Option<String>,
        target_comp_id: String,
        username: Option<String>,
        password: Option<String>,
        status: LogonStatus,
    },
    Error {
        error: GatewayError,
        library_id: i32,
        reply_to_id: i64,
        message: String,
    },
    ReleaseSessionReply {
        status: SessionReplyStatus,
        correlation_id: i64,
    },
    RequestSessionReply {
        status: SessionReplyStatus,
        correlation_id: i64,
    },
    ApplicationHeartbeat {
        library_id: i32,
    },
    ControlNotification {
        library_id: i32,
        sessions: Vec<SessionInfo>,
    },
    LibraryTimeout {
        library_id: i32,
        connect_correlation_id: i64,
    },
    Message {
        library_id: i32,
        connection_id: u64,
        session_id: i64,
        msg_type: String,
        body: Bytes,
    },
}
