//! Server-side control session
//!
//! [`ServerSession`] holds what every connection shares: supported versions, the
//! content store, the connection arena and the subscription engine. Each control
//! stream gets its own [`ControlStreamHandler`] that reassembles control messages
//! and applies them to its connection.

use crate::connection::{
    ConnectionArena, ConnectionHandle, ConnectionState, SetupState, StreamEvent,
    StreamEventHandler, StreamHandle,
};
use crate::content_store::ContentStore;
use crate::error::MoqtError;
use crate::moqt::{
    ClientSetupMessage, MessageHandler, Parameter, Reassembler, ReassemblerConfig, Role,
    ServerSetupMessage, SubscribeMessage, TrackStatusCode, TrackStatusMessage,
    TrackStatusRequestMessage, UnsubscribeMessage, Version, WireFormat, WireMessage,
};
use crate::subscription::SubscriptionManager;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session termination codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCode {
    /// Orderly close
    NoError = 0x0,
    /// Relay failure
    InternalError = 0x1,
    /// Peer broke the protocol
    ProtocolViolation = 0x3,
}

impl TerminationCode {
    /// Wire value
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Versions the relay accepts
    pub supported_versions: Vec<Version>,
    /// Role announced in SERVER_SETUP
    pub role: Role,
    /// Limits for control and peer data streams
    pub reassembler: ReassemblerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![0xff00_0005],
            role: Role::Publisher,
            reassembler: ReassemblerConfig::default(),
        }
    }
}

/// React to an error raised while handling a stream event
///
/// Protocol errors close the connection; anything else is logged.
pub fn handle_stream_error(connection: &ConnectionState, error: MoqtError) {
    if error.is_protocol_error() {
        warn!("Protocol error, closing connection: {}", error);
        connection.close(TerminationCode::ProtocolViolation.code(), &error.to_string());
        return;
    }
    match error {
        MoqtError::StreamNotFound { stream_id } => {
            debug!("Event for unknown stream {}", stream_id);
        }
        MoqtError::ConnectionExpired => debug!("Event after connection closed"),
        MoqtError::ControlStreamAlreadyEstablished => {
            connection.close(
                TerminationCode::ProtocolViolation.code(),
                "duplicate control stream",
            );
        }
        other => warn!("Stream error: {}", other),
    }
}

/// State shared by all connections of a relay
pub struct ServerSession {
    config: SessionConfig,
    store: Arc<dyn ContentStore>,
    arena: Arc<ConnectionArena>,
    subscriptions: SubscriptionManager,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("config", &self.config)
            .field("connections", &self.arena.len())
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl ServerSession {
    /// Create a session
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn ContentStore>,
        arena: Arc<ConnectionArena>,
        subscriptions: SubscriptionManager,
    ) -> Self {
        Self {
            config,
            store,
            arena,
            subscriptions,
        }
    }

    /// Connection arena
    pub fn arena(&self) -> &Arc<ConnectionArena> {
        &self.arena
    }

    /// Subscription engine
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Reassembler limits for new streams
    pub fn reassembler_config(&self) -> ReassemblerConfig {
        self.config.reassembler.clone()
    }

    /// Handler for the control stream of `connection`
    pub fn control_handler(self: &Arc<Self>, connection: ConnectionHandle) -> Arc<ControlStreamHandler> {
        Arc::new(ControlStreamHandler::new(self.clone(), connection))
    }

    /// React to an error raised while handling a stream event
    pub fn handle_stream_error(&self, connection: &ConnectionState, error: MoqtError) {
        handle_stream_error(connection, error)
    }

    fn send_control<M: WireMessage>(
        &self,
        connection: &ConnectionState,
        message: &M,
    ) -> Result<(), MoqtError> {
        let mut buf = BytesMut::new();
        WireFormat::serialize_message(&mut buf, message)?;
        connection.enqueue_control_buffer(buf.freeze())
    }

    fn require_setup(connection: &ConnectionState, what: &str) -> Result<(), MoqtError> {
        if !connection.is_setup_complete() {
            return Err(MoqtError::ProtocolViolation {
                reason: format!("{} before CLIENT_SETUP", what),
            });
        }
        Ok(())
    }

    /// Negotiate a version and answer with SERVER_SETUP
    pub fn handle_client_setup(
        &self,
        connection: &ConnectionState,
        message: ClientSetupMessage,
    ) -> Result<(), MoqtError> {
        if connection.is_setup_complete() {
            return Err(MoqtError::ProtocolViolation {
                reason: "duplicate CLIENT_SETUP".to_string(),
            });
        }

        let version = message
            .supported_versions
            .iter()
            .copied()
            .find(|v| self.config.supported_versions.contains(v))
            .ok_or_else(|| MoqtError::VersionNegotiation {
                offered: message.supported_versions.clone(),
            })?;

        let setup = SetupState {
            version: Some(version),
            peer_role: message.role(),
            path: message.path().map(str::to_string),
        };
        info!(
            "Setup complete: version {:#x}, peer role {:?}",
            version, setup.peer_role
        );
        connection.complete_setup(setup);

        self.send_control(
            connection,
            &ServerSetupMessage {
                selected_version: version,
                parameters: vec![Parameter::role(self.config.role)],
            },
        )
    }

    /// Hand a SUBSCRIBE to the subscription engine
    pub fn handle_subscribe(
        &self,
        connection: &ConnectionState,
        handle: ConnectionHandle,
        message: SubscribeMessage,
    ) -> Result<(), MoqtError> {
        Self::require_setup(connection, "SUBSCRIBE")?;
        self.subscriptions.add_subscription(handle, message)
    }

    /// Cancel a subscription
    pub fn handle_unsubscribe(
        &self,
        connection: &ConnectionState,
        message: UnsubscribeMessage,
    ) -> Result<(), MoqtError> {
        Self::require_setup(connection, "UNSUBSCRIBE")?;
        if connection.cancel_subscription(message.subscribe_id) {
            debug!("Unsubscribe {}", message.subscribe_id);
        } else {
            debug!("Unsubscribe for inactive subscription {}", message.subscribe_id);
        }
        Ok(())
    }

    /// Answer a TRACK_STATUS_REQUEST from the content store
    pub fn handle_track_status_request(
        &self,
        connection: &ConnectionState,
        message: TrackStatusRequestMessage,
    ) -> Result<(), MoqtError> {
        Self::require_setup(connection, "TRACK_STATUS_REQUEST")?;

        let track = self
            .store
            .resolve_track(&message.track_namespace, &message.track_name);
        let (status, last_group_id, last_object_id) = match track {
            None => (TrackStatusCode::DoesNotExist, 0, 0),
            Some(track) => match self.store.latest_object(track) {
                None => (TrackStatusCode::NotYetBegun, 0, 0),
                Some(latest) if self.store.is_finished(track) => {
                    (TrackStatusCode::Finished, latest.group, latest.object)
                }
                Some(latest) => (TrackStatusCode::InProgress, latest.group, latest.object),
            },
        };

        self.send_control(
            connection,
            &TrackStatusMessage {
                track_namespace: message.track_namespace,
                track_name: message.track_name,
                status_code: status.code(),
                last_group_id,
                last_object_id,
            },
        )
    }
}

/// Control stream handler of one connection
pub struct ControlStreamHandler {
    session: Arc<ServerSession>,
    connection: ConnectionHandle,
    reassembler: Mutex<Reassembler>,
}

impl ControlStreamHandler {
    /// Create a handler for `connection`
    pub fn new(session: Arc<ServerSession>, connection: ConnectionHandle) -> Self {
        let reassembler = Reassembler::new(session.reassembler_config());
        Self {
            session,
            connection,
            reassembler: Mutex::new(reassembler),
        }
    }
}

struct ControlDispatch<'a> {
    session: &'a ServerSession,
    connection: &'a ConnectionState,
    handle: ConnectionHandle,
}

impl MessageHandler for ControlDispatch<'_> {
    fn on_client_setup(&mut self, message: ClientSetupMessage) -> Result<(), MoqtError> {
        self.session.handle_client_setup(self.connection, message)
    }

    fn on_subscribe(&mut self, message: SubscribeMessage) -> Result<(), MoqtError> {
        self.session
            .handle_subscribe(self.connection, self.handle, message)
    }

    fn on_unsubscribe(&mut self, message: UnsubscribeMessage) -> Result<(), MoqtError> {
        self.session.handle_unsubscribe(self.connection, message)
    }

    fn on_track_status_request(
        &mut self,
        message: TrackStatusRequestMessage,
    ) -> Result<(), MoqtError> {
        self.session
            .handle_track_status_request(self.connection, message)
    }
}

impl StreamEventHandler for ControlStreamHandler {
    fn on_event(
        &self,
        connection: &ConnectionState,
        stream: StreamHandle,
        event: StreamEvent,
    ) -> Result<(), MoqtError> {
        match event {
            StreamEvent::Receive(data) => {
                let mut dispatch = ControlDispatch {
                    session: &self.session,
                    connection,
                    handle: self.connection,
                };
                self.reassembler.lock().append(&data, &mut dispatch)?;
                Ok(())
            }
            StreamEvent::PeerSendShutdown | StreamEvent::PeerSendAborted { .. } => {
                Err(MoqtError::ProtocolViolation {
                    reason: format!("Peer closed control {}", stream),
                })
            }
            StreamEvent::SendComplete { .. } | StreamEvent::ShutdownComplete => Ok(()),
        }
    }
}
