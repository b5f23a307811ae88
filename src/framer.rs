//! The framer: single-threaded owner of all live TCP connections.
//!
//! One framer instance runs on one dedicated thread. Each `do_work` tick
//! drains inbound commands, polls the accept socket, pumps every endpoint,
//! sweeps heartbeats against the clock and retries back-pressured
//! publications, in that fixed order. No step blocks and no step does
//! unbounded work, so one slow participant cannot starve the rest.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use bytes::Bytes;

use crate::clock::EpochClock;
use crate::config::EngineConfiguration;
use crate::endpoint::{EndpointFactory, ReceiverEndpoint, SenderEndpoint, TcpChannel, TcpChannelSupplier};
use crate::error::{EngineError, ErrorHandler, Result};
use crate::library::{Libraries, LibraryInfo};
use crate::messages::{
    ConnectionType, DisconnectReason, GatewayError, InitiateRequest, LibraryCommand, LogonStatus,
    SessionInfo, SessionReplyStatus, SessionState, AUTOMATIC_INITIAL_SEQUENCE_NUMBER,
    ENGINE_LIBRARY_ID, NO_MESSAGE_REPLAY, UNKNOWN_SESSION,
};
use crate::protocol;
use crate::publication::GatewayPublication;
use crate::sequence::SequenceNumbers;
use crate::session::{CompositeKey, GatewaySession, GatewaySessions, HeartbeatAction};
use crate::session_ids::{SessionIdStore, DUPLICATE_SESSION};
use crate::subscription::{Action, CommandHandler, CommandSubscription};

/// Cluster-leadership flag. Queried on every accept attempt; the answer is
/// a racy hint and is never cached across ticks.
pub trait ClusterStreams: Send {
    fn is_leader(&self) -> bool;
}

/// Single-node deployment: always leader.
#[derive(Debug, Default)]
pub struct SoloStreams;

impl ClusterStreams for SoloStreams {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Replay scheduling against the replicated log. The log itself performs
/// the replay; the framer only requests it during session hand-off.
pub trait ReplayQuery: Send {
    fn query(&mut self, session_id: i64, begin_sequence_number: i32, library_id: i32);
}

#[derive(Debug, Default)]
pub struct NoReplayQuery;

impl ReplayQuery for NoReplayQuery {
    fn query(&mut self, _session_id: i64, _begin_sequence_number: i32, _library_id: i32) {}
}

/// Decides whether a logon may proceed.
pub trait AuthenticationStrategy: Send {
    fn authenticate(&mut self, logon: &protocol::LogonFields) -> bool;
}

#[derive(Debug, Default)]
pub struct AcceptAllAuthentication;

impl AuthenticationStrategy for AcceptAllAuthentication {
    fn authenticate(&mut self, _logon: &protocol::LogonFields) -> bool {
        true
    }
}

/// One live TCP connection and everything the framer knows about it.
struct Connection {
    connection_type: ConnectionType,
    /// `ENGINE_LIBRARY_ID` or the owning library
    owner: i32,
    address: String,
    key: Option<CompositeKey>,
    heartbeat_interval_s: u32,
    username: Option<String>,
    password: Option<String>,
    receiver: ReceiverEndpoint,
    sender: SenderEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiateStage {
    SaveManageConnection,
    SaveLogon,
}

/// In-flight reply for an `InitiateConnection`. Survives back-pressured
/// ticks so redelivery never re-connects or re-publishes a committed stage.
struct InitiateReply {
    stage: InitiateStage,
    connection_id: u64,
    session_id: i64,
    address: String,
    last_sent_sequence_number: i32,
    last_received_sequence_number: i32,
}

enum AdminMessage {
    Heartbeat,
    TestRequest,
}

pub struct Framer {
    clock: Arc<dyn EpochClock>,
    configuration: EngineConfiguration,
    listener: Option<TcpListener>,
    endpoint_factory: Box<dyn EndpointFactory>,
    channel_supplier: Box<dyn TcpChannelSupplier>,
    command_subscription: Option<CommandSubscription>,
    inbound_publication: Box<dyn GatewayPublication>,
    session_ids: Box<dyn SessionIdStore>,
    sent_sequence_numbers: Box<dyn SequenceNumbers>,
    received_sequence_numbers: Box<dyn SequenceNumbers>,
    replay_query: Box<dyn ReplayQuery>,
    node: Box<dyn ClusterStreams>,
    authentication: Box<dyn AuthenticationStrategy>,
    error_handler: Box<dyn ErrorHandler>,
    gateway_sessions: GatewaySessions,
    libraries: Libraries,
    connections: HashMap<u64, Connection>,
    next_connection_id: u64,
    initiate_replies: HashMap<i64, InitiateReply>,
    acquired_releases: HashSet<i64>,
    handed_off_requests: HashSet<i64>,
    pending_timeouts: VecDeque<(i32, i64)>,
    closed: bool,
}

impl Framer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn EpochClock>,
        configuration: EngineConfiguration,
        endpoint_factory: Box<dyn EndpointFactory>,
        command_subscription: CommandSubscription,
        inbound_publication: Box<dyn GatewayPublication>,
        session_ids: Box<dyn SessionIdStore>,
        sent_sequence_numbers: Box<dyn SequenceNumbers>,
        received_sequence_numbers: Box<dyn SequenceNumbers>,
        replay_query: Box<dyn ReplayQuery>,
        node: Box<dyn ClusterStreams>,
        authentication: Box<dyn AuthenticationStrategy>,
        channel_supplier: Box<dyn TcpChannelSupplier>,
        error_handler: Box<dyn ErrorHandler>,
    ) -> Result<Self> {
        let address = configuration.bind_address();
        let listener = TcpListener::bind(&address).map_err(|source| EngineError::Bind {
            addr: address.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| EngineError::Bind { addr: address, source })?;
        tracing::info!(address = %configuration.bind_address(), "framer listening");

        Ok(Self {
            clock,
            configuration,
            listener: Some(listener),
            endpoint_factory,
            channel_supplier,
            command_subscription: Some(command_subscription),
            inbound_publication,
            session_ids,
            sent_sequence_numbers,
            received_sequence_numbers,
            replay_query,
            node,
            authentication,
            error_handler,
            gateway_sessions: GatewaySessions::new(),
            libraries: Libraries::new(),
            connections: HashMap::new(),
            next_connection_id: 0,
            initiate_replies: HashMap::new(),
            acquired_releases: HashSet::new(),
            handed_off_requests: HashSet::new(),
            pending_timeouts: VecDeque::new(),
            closed: false,
        })
    }

    /// One cooperative tick. Returns the amount of work done so the
    /// caller's idle strategy can back off when the loop goes quiet.
    pub fn do_work(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        let mut work = 0;
        work += self.poll_commands();
        work += self.poll_accepts();
        work += self.poll_receivers();
        work += self.poll_senders();
        work += self.poll_timeouts();
        work += self.retry_pending_publications();
        work
    }

    /// Bounded cleanup, safe to call more than once.
    pub fn on_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener = None;
        for connection in self.connections.values_mut() {
            connection.sender.close();
            connection.receiver.close(DisconnectReason::EngineClose);
        }
        self.connections.clear();
        self.gateway_sessions.clear();
        tracing::info!("framer closed");
    }

    // --- command handlers -------------------------------------------------

    pub fn on_library_connect(
        &mut self,
        library_id: i32,
        correlation_id: i64,
        aeron_session_id: i32,
    ) -> Action {
        let now = self.clock.time_ms();

        if self.libraries.contains(library_id) {
            if self.inbound_publication.save_application_heartbeat(library_id) < 0 {
                return Action::Abort;
            }
            let handed_off = self.sessions_handed_to(library_id);
            if self
                .inbound_publication
                .save_control_notification(library_id, &handed_off)
                < 0
            {
                return Action::Abort;
            }
            if let Some(library) = self.libraries.get_mut(library_id) {
                library.on_heartbeat(now);
                library.aeron_session_id = aeron_session_id;
                library.connect_correlation_id = correlation_id;
            }
            tracing::info!(library_id, "duplicate library connect");
            return Action::Continue;
        }

        if self.inbound_publication.save_application_heartbeat(library_id) < 0 {
            return Action::Abort;
        }

        // Offer every authenticated engine-held session to the newcomer.
        let notifications: Vec<(u64, i64, i32, i32, CompositeKey, Option<String>, Option<String>)> =
            self.gateway_sessions
                .authenticated()
                .iter()
                .filter_map(|session| {
                    session.key.clone().map(|key| {
                        (
                            session.connection_id,
                            session.session_id,
                            session.last_sent_sequence_number,
                            session.last_received_sequence_number,
                            key,
                            session.username.clone(),
                            session.password.clone(),
                        )
                    })
                })
                .collect();
        for (connection_id, session_id, last_sent, last_recv, key, username, password) in
            &notifications
        {
            let position = self.inbound_publication.save_logon(
                library_id,
                *connection_id,
                *session_id,
                *last_sent,
                *last_recv,
                &key.sender_comp_id,
                key.qualifier.as_deref(),
                None,
                &key.target_comp_id,
                username.as_deref(),
                password.as_deref(),
                LogonStatus::LibraryNotification,
            );
            if position < 0 {
                return Action::Abort;
            }
        }

        let reclaimed = self.gateway_sessions.previously_owned_by(library_id);
        if !reclaimed.is_empty()
            && self
                .inbound_publication
                .save_control_notification(library_id, &reclaimed)
                < 0
        {
            return Action::Abort;
        }

        self.libraries.insert(LibraryInfo::new(
            library_id,
            aeron_session_id,
            correlation_id,
            now,
        ));
        tracing::info!(library_id, aeron_session_id, "library connected");
        Action::Continue
    }

    pub fn on_initiate_connection(&mut self, request: &InitiateRequest) -> Action {
        let library_id = request.library_id;
        let correlation_id = request.correlation_id;
        let now = self.clock.time_ms();

        if !self.libraries.contains(library_id) {
            let position = self.inbound_publication.save_error(
                GatewayError::UnknownLibrary,
                library_id,
                correlation_id,
                "initiate from a library that never connected",
            );
            return if position < 0 { Action::Abort } else { Action::Continue };
        }
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.on_heartbeat(now);
        }

        if !self.initiate_replies.contains_key(&correlation_id) {
            match self.open_initiated_connection(request, now) {
                Ok(Some(())) => {}
                Ok(None) => return Action::Continue,
                Err(abort) => return abort,
            }
        }

        let Some(reply) = self.initiate_replies.get_mut(&correlation_id) else {
            return Action::Continue;
        };
        if reply.stage == InitiateStage::SaveManageConnection {
            let position = self.inbound_publication.save_manage_connection(
                reply.connection_id,
                reply.session_id,
                &reply.address,
                library_id,
                ConnectionType::Initiator,
                reply.last_sent_sequence_number,
                reply.last_received_sequence_number,
                SessionState::Connected,
                request.heartbeat_interval_s,
                correlation_id,
            );
            if position < 0 {
                return Action::Abort;
            }
            reply.stage = InitiateStage::SaveLogon;
        }
        if reply.stage == InitiateStage::SaveLogon {
            let position = self.inbound_publication.save_logon(
                library_id,
                reply.connection_id,
                reply.session_id,
                reply.last_sent_sequence_number,
                reply.last_received_sequence_number,
                &request.sender_comp_id,
                request.sender_sub_id.as_deref(),
                request.sender_location_id.as_deref(),
                &request.target_comp_id,
                request.username.as_deref(),
                request.password.as_deref(),
                LogonStatus::New,
            );
            if position < 0 {
                return Action::Abort;
            }
        }
        self.initiate_replies.remove(&correlation_id);
        Action::Continue
    }

    /// TCP connect + id allocation for a first-time initiate. `Ok(None)`
    /// means the request was answered with an error publication;
    /// `Err(action)` means that error publication itself back-pressured.
    fn open_initiated_connection(
        &mut self,
        request: &InitiateRequest,
        now: u64,
    ) -> std::result::Result<Option<()>, Action> {
        let library_id = request.library_id;
        let correlation_id = request.correlation_id;

        let channel_pair = self
            .channel_supplier
            .open(&request.host, request.port)
            .and_then(|receiver_channel| {
                let sender_channel = receiver_channel.try_clone()?;
                Ok((receiver_channel, sender_channel))
            });
        let (receiver_channel, sender_channel) = match channel_pair {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(
                    library_id,
                    host = %request.host,
                    port = request.port,
                    error = %e,
                    "unable to connect"
                );
                let position = self.inbound_publication.save_error(
                    GatewayError::UnableToConnect,
                    library_id,
                    correlation_id,
                    &e.to_string(),
                );
                if position < 0 {
                    return Err(Action::Abort);
                }
                return Ok(None);
            }
        };

        let key = request.key();
        let session_id = self.session_ids.on_logon(&key);
        if session_id == DUPLICATE_SESSION {
            let position = self.inbound_publication.save_error(
                GatewayError::DuplicateSession,
                library_id,
                correlation_id,
                &format!("{} is already logged on", key),
            );
            if position < 0 {
                return Err(Action::Abort);
            }
            return Ok(None);
        }

        let connection_id = self.allocate_connection_id();
        let address = receiver_channel.peer().to_string();
        let receiver = self.endpoint_factory.receiver_endpoint(
            receiver_channel,
            connection_id,
            session_id,
            library_id,
        );
        let sender = self
            .endpoint_factory
            .sender_endpoint(sender_channel, connection_id, library_id);
        self.connections.insert(
            connection_id,
            Connection {
                connection_type: ConnectionType::Initiator,
                owner: library_id,
                address: address.clone(),
                key: Some(key),
                heartbeat_interval_s: request.heartbeat_interval_s,
                username: request.username.clone(),
                password: request.password.clone(),
                receiver,
                sender,
            },
        );
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.add_connection(connection_id);
        }

        let last_sent = if request.initial_sequence_number == AUTOMATIC_INITIAL_SEQUENCE_NUMBER {
            self.sent_sequence_numbers.last_known(session_id)
        } else {
            request.initial_sequence_number
        };
        let last_recv = self.received_sequence_numbers.last_known(session_id);
        self.initiate_replies.insert(
            correlation_id,
            InitiateReply {
                stage: InitiateStage::SaveManageConnection,
                connection_id,
                session_id,
                address: address.clone(),
                last_sent_sequence_number: last_sent,
                last_received_sequence_number: last_recv,
            },
        );
        tracing::info!(connection_id, library_id, address = %address, now, "initiated connection");
        Ok(Some(()))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_release_session(
        &mut self,
        library_id: i32,
        connection_id: u64,
        correlation_id: i64,
        _state: SessionState,
        heartbeat_interval_ms: u64,
        last_sent_sequence_number: i32,
        last_received_sequence_number: i32,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Action {
        let now = self.clock.time_ms();
        if !self.libraries.contains(library_id) {
            let position = self.inbound_publication.save_error(
                GatewayError::UnknownLibrary,
                library_id,
                correlation_id,
                "release from a library that never connected",
            );
            return if position < 0 { Action::Abort } else { Action::Continue };
        }
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.on_heartbeat(now);
        }

        if !self.acquired_releases.contains(&correlation_id) {
            if !self.connections.contains_key(&connection_id) {
                let position = self
                    .inbound_publication
                    .save_release_session_reply(SessionReplyStatus::UnknownSession, correlation_id);
                return if position < 0 { Action::Abort } else { Action::Continue };
            }
            let session = {
                let connection = self
                    .connections
                    .get_mut(&connection_id)
                    .expect("checked above");
                connection.owner = ENGINE_LIBRARY_ID;
                connection.receiver.set_library_id(ENGINE_LIBRARY_ID);
                connection.sender.set_library_id(ENGINE_LIBRARY_ID);
                let mut session =
                    GatewaySession::new(connection_id, connection.connection_type, now);
                session.session_id = connection.receiver.session_id();
                session.key = connection.key.clone();
                session
            };
            if let Some(library) = self.libraries.get_mut(library_id) {
                library.remove_connection(connection_id);
            }
            let heartbeat_interval_s = (heartbeat_interval_ms / 1000) as u32;
            self.gateway_sessions.acquire(
                session,
                SessionState::Active,
                heartbeat_interval_s,
                last_sent_sequence_number,
                last_received_sequence_number,
                username.map(str::to_string),
                password.map(str::to_string),
                now,
            );
            self.acquired_releases.insert(correlation_id);
            tracing::info!(connection_id, library_id, "session released to engine");
        }

        if self
            .inbound_publication
            .save_release_session_reply(SessionReplyStatus::Ok, correlation_id)
            < 0
        {
            return Action::Abort;
        }
        self.acquired_releases.remove(&correlation_id);
        Action::Continue
    }

    pub fn on_request_session(
        &mut self,
        library_id: i32,
        session_id: i64,
        correlation_id: i64,
        last_received_sequence_number: i32,
    ) -> Action {
        let now = self.clock.time_ms();
        if !self.libraries.contains(library_id) {
            let position = self.inbound_publication.save_error(
                GatewayError::UnknownLibrary,
                library_id,
                correlation_id,
                "session request from a library that never connected",
            );
            return if position < 0 { Action::Abort } else { Action::Continue };
        }
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.on_heartbeat(now);
        }

        if !self.handed_off_requests.contains(&correlation_id) {
            let target = self
                .gateway_sessions
                .sessions()
                .find(|session| session.session_id == session_id && session.is_active())
                .map(|session| session.connection_id);
            let Some(connection_id) = target else {
                let position = self
                    .inbound_publication
                    .save_request_session_reply(SessionReplyStatus::UnknownSession, correlation_id);
                return if position < 0 { Action::Abort } else { Action::Continue };
            };

            self.gateway_sessions.remove_by_connection(connection_id);
            if let Some(connection) = self.connections.get_mut(&connection_id) {
                connection.owner = library_id;
                connection.receiver.set_library_id(library_id);
                connection.sender.set_library_id(library_id);
            }
            if let Some(library) = self.libraries.get_mut(library_id) {
                library.add_connection(connection_id);
            }
            if last_received_sequence_number != NO_MESSAGE_REPLAY {
                self.replay_query
                    .query(session_id, last_received_sequence_number + 1, library_id);
            }
            self.handed_off_requests.insert(correlation_id);
            tracing::info!(connection_id, session_id, library_id, "session handed to library");
        }

        if self
            .inbound_publication
            .save_request_session_reply(SessionReplyStatus::Ok, correlation_id)
            < 0
        {
            return Action::Abort;
        }
        self.handed_off_requests.remove(&correlation_id);
        Action::Continue
    }

    pub fn on_disconnect(
        &mut self,
        library_id: i32,
        connection_id: u64,
        reason: DisconnectReason,
    ) -> Action {
        let now = self.clock.time_ms();
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.on_heartbeat(now);
        }
        self.disconnect(connection_id, reason);
        Action::Continue
    }

    pub fn on_application_heartbeat(&mut self, library_id: i32) -> Action {
        let now = self.clock.time_ms();
        if let Some(library) = self.libraries.get_mut(library_id) {
            library.on_heartbeat(now);
        }
        Action::Continue
    }

    // --- tick sub-steps ---------------------------------------------------

    fn poll_commands(&mut self) -> usize {
        let Some(mut subscription) = self.command_subscription.take() else {
            return 0;
        };
        let limit = self.configuration.command_fragment_limit;
        let consumed = subscription.poll(self, limit);
        self.command_subscription = Some(subscription);
        consumed
    }

    fn poll_accepts(&mut self) -> usize {
        let mut accepted = 0;
        while accepted < self.configuration.accept_limit {
            let result = match &self.listener {
                Some(listener) => listener.accept(),
                None => break,
            };
            match result {
                Ok((stream, peer)) => {
                    accepted += 1;
                    if !self.node.is_leader() {
                        drop(stream);
                        self.error_handler.on_error(EngineError::NotLeader(peer));
                        continue;
                    }
                    if let Err(source) = self.register_accepted(stream) {
                        self.error_handler.on_error(EngineError::ConnectionIo {
                            connection_id: self.next_connection_id,
                            source,
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    self.error_handler.on_error(EngineError::ConnectionIo {
                        connection_id: 0,
                        source,
                    });
                    break;
                }
            }
        }
        accepted
    }

    fn register_accepted(&mut self, stream: TcpStream) -> io::Result<()> {
        let receiver_channel = TcpChannel::new(stream)?;
        let sender_channel = receiver_channel.try_clone()?;
        let peer = receiver_channel.peer();
        let connection_id = self.allocate_connection_id();

        let receiver = self.endpoint_factory.receiver_endpoint(
            receiver_channel,
            connection_id,
            UNKNOWN_SESSION,
            ENGINE_LIBRARY_ID,
        );
        let sender =
            self.endpoint_factory
                .sender_endpoint(sender_channel, connection_id, ENGINE_LIBRARY_ID);
        self.connections.insert(
            connection_id,
            Connection {
                connection_type: ConnectionType::Acceptor,
                owner: ENGINE_LIBRARY_ID,
                address: peer.to_string(),
                key: None,
                heartbeat_interval_s: 0,
                username: None,
                password: None,
                receiver,
                sender,
            },
        );

        let now = self.clock.time_ms();
        let session = GatewaySession::accepted(connection_id, now);
        self.gateway_sessions
            .acquire(session, SessionState::Connected, 0, 0, 0, None, None, now);
        tracing::info!(connection_id, peer = %peer, "accepted connection");
        Ok(())
    }

    fn poll_receivers(&mut self) -> usize {
        let frame_limit = self.configuration.frames_per_connection;
        let mut work = 0;
        let mut to_disconnect: Vec<(u64, DisconnectReason)> = Vec::new();

        let mut connection_ids: Vec<u64> = self.connections.keys().copied().collect();
        connection_ids.sort_unstable();

        for connection_id in connection_ids {
            let poll = {
                let Some(connection) = self.connections.get_mut(&connection_id) else {
                    continue;
                };
                match connection.receiver.poll_for_data(frame_limit) {
                    Ok(poll) => poll,
                    Err(source) => {
                        self.error_handler
                            .on_error(EngineError::ConnectionIo { connection_id, source });
                        to_disconnect.push((connection_id, DisconnectReason::Exception));
                        continue;
                    }
                }
            };

            let mut frames = poll.frames.into_iter();
            while let Some(frame) = frames.next() {
                work += 1;
                match self.on_frame(connection_id, frame) {
                    FrameOutcome::Forwarded => {}
                    FrameOutcome::BackPressured(frame) => {
                        // Park this frame and everything behind it, in order.
                        if let Some(connection) = self.connections.get_mut(&connection_id) {
                            connection.receiver.park(frame);
                            for rest in frames.by_ref() {
                                connection.receiver.park(rest);
                            }
                        }
                        break;
                    }
                    FrameOutcome::Disconnect(reason) => {
                        to_disconnect.push((connection_id, reason));
                        break;
                    }
                }
            }

            if poll.closed_by_peer {
                to_disconnect.push((connection_id, DisconnectReason::RemoteDisconnect));
            }
        }

        for (connection_id, reason) in to_disconnect {
            self.disconnect(connection_id, reason);
            work += 1;
        }
        work
    }

    fn poll_senders(&mut self) -> usize {
        let mut work = 0;
        let mut failed: Vec<(u64, io::Error)> = Vec::new();
        for (connection_id, connection) in self.connections.iter_mut() {
            match connection.sender.poll() {
                Ok(written) if written > 0 => work += 1,
                Ok(_) => {}
                Err(source) => failed.push((*connection_id, source)),
            }
        }
        for (connection_id, source) in failed {
            self.error_handler
                .on_error(EngineError::ConnectionIo { connection_id, source });
            self.disconnect(connection_id, DisconnectReason::Exception);
            work += 1;
        }
        work
    }

    fn poll_timeouts(&mut self) -> usize {
        let now = self.clock.time_ms();
        let mut work = 0;

        let expired = self
            .libraries
            .expired(now, self.configuration.reply_timeout_ms);
        for library_id in expired {
            if let Some(library) = self.libraries.remove(library_id) {
                work += 1;
                tracing::warn!(library_id, "library timed out; reclaiming its connections");
                for connection_id in library.owned_connections() {
                    self.reclaim(connection_id, library_id, now);
                }
                if self.inbound_publication.save_library_timeout(library_id, 0) < 0 {
                    self.pending_timeouts.push_back((library_id, 0));
                }
            }
        }

        for action in self.gateway_sessions.poll(now) {
            work += 1;
            match action {
                HeartbeatAction::SendHeartbeat { connection_id } => {
                    self.send_admin(connection_id, AdminMessage::Heartbeat, now);
                }
                HeartbeatAction::SendTestRequest { connection_id } => {
                    self.send_admin(connection_id, AdminMessage::TestRequest, now);
                }
                HeartbeatAction::Disconnect { connection_id } => {
                    tracing::warn!(connection_id, "session heartbeat timeout");
                    self.disconnect(connection_id, DisconnectReason::Timeout);
                }
            }
        }
        work
    }

    fn retry_pending_publications(&mut self) -> usize {
        let mut work = 0;
        while let Some((library_id, correlation_id)) = self.pending_timeouts.pop_front() {
            if self
                .inbound_publication
                .save_library_timeout(library_id, correlation_id)
                < 0
            {
                self.pending_timeouts.push_front((library_id, correlation_id));
                break;
            }
            work += 1;
        }
        work
    }

    // --- internals --------------------------------------------------------

    fn allocate_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    fn on_frame(&mut self, connection_id: u64, frame: Bytes) -> FrameOutcome {
        let now = self.clock.time_ms();
        let seq = protocol::msg_seq_num(&frame);
        if let Some(session) = self.gateway_sessions.get_mut(connection_id) {
            session.on_frame_received(now, seq);
        }

        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return FrameOutcome::Forwarded;
        };

        // Engine-held acceptor completing logon.
        if connection.owner == ENGINE_LIBRARY_ID
            && connection.key.is_none()
            && protocol::is_logon(&frame)
        {
            let Some(logon) = protocol::parse_logon(&frame) else {
                return FrameOutcome::Disconnect(DisconnectReason::ProtocolError);
            };
            if !self.authentication.authenticate(&logon) {
                tracing::warn!(connection_id, "logon rejected by authentication strategy");
                return FrameOutcome::Disconnect(DisconnectReason::FailedAuthentication);
            }
            let key = CompositeKey {
                sender_comp_id: logon.sender_comp_id.clone(),
                target_comp_id: logon.target_comp_id.clone(),
                qualifier: logon.sender_sub_id.clone(),
            };
            let session_id = self.session_ids.on_logon(&key);
            if session_id == DUPLICATE_SESSION {
                tracing::warn!(connection_id, key = %key, "duplicate logon");
                return FrameOutcome::Disconnect(DisconnectReason::DuplicateSession);
            }

            connection.receiver.set_session_id(session_id);
            connection.key = Some(key.clone());
            connection.heartbeat_interval_s = logon.heartbeat_interval_s;
            connection.username = logon.username.clone();
            connection.password = logon.password.clone();

            if let Some(session) = self.gateway_sessions.get_mut(connection_id) {
                session.session_id = session_id;
                session.key = Some(key.clone());
                session.state = SessionState::Active;
                session.heartbeat_interval_s = logon.heartbeat_interval_s;
                session.username = logon.username.clone();
                session.password = logon.password.clone();

                // Answer the logon so the counterparty's session goes live.
                let seq = session.next_sender_seq();
                let ack = protocol::build_logon(
                    logon.heartbeat_interval_s,
                    &key.target_comp_id,
                    &key.sender_comp_id,
                    seq,
                );
                connection.sender.enqueue(&ack);
                session.on_bytes_sent(now);
            }
            tracing::info!(connection_id, session_id, key = %key, "session authenticated");
        }

        let session_id = connection.receiver.session_id();
        let owner = connection.owner;
        let msg_type = protocol::msg_type(&frame).unwrap_or("?").to_string();
        let position = self.inbound_publication.save_message(
            owner,
            connection_id,
            session_id,
            &msg_type,
            frame.clone(),
        );
        if position < 0 {
            tracing::debug!(connection_id, "message forward back-pressured");
            return FrameOutcome::BackPressured(frame);
        }
        FrameOutcome::Forwarded
    }

    /// A library went away: its connection becomes engine-managed again.
    fn reclaim(&mut self, connection_id: u64, library_id: i32, now_ms: u64) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        connection.owner = ENGINE_LIBRARY_ID;
        connection.receiver.set_library_id(ENGINE_LIBRARY_ID);
        connection.sender.set_library_id(ENGINE_LIBRARY_ID);

        // Logon-complete connections come back live; acceptors still in
        // logon come back merely connected.
        let state = if connection.key.is_some() {
            SessionState::Active
        } else {
            SessionState::Connected
        };
        let mut session = GatewaySession::new(connection_id, connection.connection_type, now_ms);
        session.session_id = connection.receiver.session_id();
        session.key = connection.key.clone();
        session.previous_owner = Some(library_id);
        let heartbeat_interval_s = connection.heartbeat_interval_s;
        let username = connection.username.clone();
        let password = connection.password.clone();
        let session_id = session.session_id;

        let last_sent = self.sent_sequence_numbers.last_known(session_id);
        let last_recv = self.received_sequence_numbers.last_known(session_id);
        self.gateway_sessions.acquire(
            session,
            state,
            heartbeat_interval_s,
            last_sent,
            last_recv,
            username,
            password,
            now_ms,
        );
        tracing::info!(connection_id, library_id, ?state, "connection reclaimed from library");
    }

    fn send_admin(&mut self, connection_id: u64, message: AdminMessage, now_ms: u64) {
        let Some(session) = self.gateway_sessions.get_mut(connection_id) else {
            return;
        };
        let Some(key) = session.key.clone() else {
            return;
        };
        let seq = session.next_sender_seq();
        session.on_bytes_sent(now_ms);
        let (sender_comp, target_comp) = match session.connection_type {
            // On accepted connections we are the peer's target.
            ConnectionType::Acceptor => (&key.target_comp_id, &key.sender_comp_id),
            ConnectionType::Initiator => (&key.sender_comp_id, &key.target_comp_id),
        };
        let bytes = match message {
            AdminMessage::Heartbeat => {
                protocol::build_heartbeat(None, sender_comp, target_comp, seq)
            }
            AdminMessage::TestRequest => {
                protocol::build_test_request(&format!("TR-{}", seq), sender_comp, target_comp, seq)
            }
        };
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.sender.enqueue(&bytes);
        }
    }

    fn disconnect(&mut self, connection_id: u64, reason: DisconnectReason) {
        let Some(mut connection) = self.connections.remove(&connection_id) else {
            return;
        };
        connection.receiver.close(reason);
        connection.sender.close();

        if let Some(library) = self.libraries.get_mut(connection.owner) {
            library.remove_connection(connection_id);
        }
        self.gateway_sessions.remove_by_connection(connection_id);
        let session_id = connection.receiver.session_id();
        if session_id != UNKNOWN_SESSION {
            self.session_ids.on_disconnect(session_id);
        }
        tracing::info!(connection_id, address = %connection.address, ?reason, "connection closed");
    }

    /// Sessions currently handed to `library_id`, for control notification.
    fn sessions_handed_to(&self, library_id: i32) -> Vec<SessionInfo> {
        let Some(library) = self.libraries.get(library_id) else {
            return Vec::new();
        };
        library
            .owned_connections()
            .filter_map(|connection_id| {
                let connection = self.connections.get(&connection_id)?;
                let key = connection.key.clone()?;
                Some(SessionInfo {
                    session_id: connection.receiver.session_id(),
                    connection_id,
                    key,
                })
            })
            .collect()
    }

    // --- observation ------------------------------------------------------

    /// Address the acceptor socket is bound to; `None` once closed.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn sessions(&self) -> &GatewaySessions {
        &self.gateway_sessions
    }

    pub fn libraries(&self) -> &Libraries {
        &self.libraries
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_owner(&self, connection_id: u64) -> Option<i32> {
        self.connections.get(&connection_id).map(|c| c.owner)
    }
}

enum FrameOutcome {
    Forwarded,
    BackPressured(Bytes),
    Disconnect(DisconnectReason),
}

impl CommandHandler for Framer {
    fn on_command(&mut self, command: &LibraryCommand) -> Action {
        match command {
            LibraryCommand::LibraryConnect {
                library_id,
                correlation_id,
                aeron_session_id,
            } => self.on_library_connect(*library_id, *correlation_id, *aeron_session_id),
            LibraryCommand::InitiateConnection(request) => self.on_initiate_connection(request),
            LibraryCommand::ReleaseSession {
                library_id,
                connection_id,
                correlation_id,
                state,
                heartbeat_interval_ms,
                last_sent_sequence_number,
                last_received_sequence_number,
                username,
                password,
            } => self.on_release_session(
                *library_id,
                *connection_id,
                *correlation_id,
                *state,
                *heartbeat_interval_ms,
                *last_sent_sequence_number,
                *last_received_sequence_number,
                username.as_deref(),
                password.as_deref(),
            ),
            LibraryCommand::RequestSession {
                library_id,
                session_id,
                correlation_id,
                last_received_sequence_number,
            } => self.on_request_session(
                *library_id,
                *session_id,
                *correlation_id,
                *last_received_sequence_number,
            ),
            LibraryCommand::Disconnect {
                library_id,
                connection_id,
                reason,
            } => self.on_disconnect(*library_id, *connection_id, *reason),
            LibraryCommand::ApplicationHeartbeat { library_id } => {
                self.on_application_heartbeat(*library_id)
            }
        }
    }
}
