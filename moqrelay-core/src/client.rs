//! Client-side session
//!
//! [`ClientSession`] opens the control stream, sends CLIENT_SETUP with the
//! configured role and turns everything the relay sends back into
//! [`ClientEvent`]s on an unbounded channel. Objects arrive on the relay's
//! unidirectional streams and are rebuilt by the same [`Reassembler`] the relay
//! uses for its own peer streams.
//!
//! [`MoqClient`] binds a session to a quinn connection.

use crate::connection::{
    ConnectionConfig, ConnectionState, ConnectionStats, ObjectSink, PeerDataStreamHandler,
    SetupState, StreamEvent, StreamEventHandler, StreamHandle,
};
use crate::error::MoqtError;
use crate::moqt::{
    ClientSetupMessage, MessageHandler, ObjectStreamMessage, Parameter, Reassembler,
    ReassemblerConfig, Role, ServerSetupMessage, SubscribeErrorMessage, SubscribeId,
    SubscribeMessage, SubscribeOkMessage, TrackNamespace, TrackStatusMessage,
    TrackStatusRequestMessage, UnsubscribeMessage, Version, WireFormat, WireMessage,
};
use crate::session::TerminationCode;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Client session parameters
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Versions offered in CLIENT_SETUP, in preference order
    pub supported_versions: Vec<Version>,
    /// Role announced in CLIENT_SETUP
    pub role: Role,
    /// Optional path parameter
    pub path: Option<String>,
    /// Limits for the control stream and incoming object streams
    pub reassembler: ReassemblerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![0xff00_0005],
            role: Role::Subscriber,
            path: None,
            reassembler: ReassemblerConfig::default(),
        }
    }
}

/// Something the relay told the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// SERVER_SETUP accepted
    SetupComplete {
        /// Version chosen by the relay
        version: Version,
        /// Role announced by the relay
        peer_role: Option<Role>,
    },
    /// A subscription was accepted
    SubscribeOk(SubscribeOkMessage),
    /// A subscription was rejected or failed
    SubscribeError(SubscribeErrorMessage),
    /// Answer to a track status request
    TrackStatus(TrackStatusMessage),
    /// One delivered object
    Object(ObjectStreamMessage),
}

/// Receiving side of a client's events
pub type ClientEvents = mpsc::UnboundedReceiver<ClientEvent>;

#[derive(Debug, Clone)]
struct EventSink(mpsc::UnboundedSender<ClientEvent>);

impl EventSink {
    fn emit(&self, event: ClientEvent) {
        if self.0.send(event).is_err() {
            trace!("Client event dropped, nobody is listening");
        }
    }
}

impl ObjectSink for EventSink {
    fn on_object(&self, object: ObjectStreamMessage) {
        self.emit(ClientEvent::Object(object));
    }
}

/// Client side of one connection
#[derive(Debug)]
pub struct ClientSession {
    config: ClientConfig,
    connection: Arc<ConnectionState>,
    events: EventSink,
}

impl ClientSession {
    /// Open the control stream and send CLIENT_SETUP
    pub fn start(
        config: ClientConfig,
        connection: Arc<ConnectionState>,
    ) -> Result<(Self, ClientEvents), MoqtError> {
        if config.supported_versions.is_empty() {
            return Err(MoqtError::InvalidState {
                expected: "at least one supported version".to_string(),
                actual: "no versions configured".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSink(tx);
        let handler = Arc::new(ClientControlHandler::new(&config, events.clone()));
        connection.establish_control_stream(handler)?;

        let mut parameters = vec![Parameter::role(config.role)];
        if let Some(path) = &config.path {
            parameters.push(Parameter::path(path));
        }
        let session = Self {
            config,
            connection,
            events,
        };
        session.send_control(&ClientSetupMessage {
            supported_versions: session.config.supported_versions.clone(),
            parameters,
        })?;
        info!(
            "Sent CLIENT_SETUP offering {:x?} as {:?}",
            session.config.supported_versions, session.config.role
        );
        Ok((session, rx))
    }

    /// Connection state
    pub fn connection(&self) -> &Arc<ConnectionState> {
        &self.connection
    }

    /// Session parameters
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handler for an object stream opened by the relay
    pub fn data_stream_handler(&self) -> Arc<PeerDataStreamHandler> {
        Arc::new(PeerDataStreamHandler::with_sink(
            self.config.reassembler.clone(),
            Arc::new(self.events.clone()),
        ))
    }

    fn send_control<M: WireMessage>(&self, message: &M) -> Result<(), MoqtError> {
        let mut buf = BytesMut::new();
        WireFormat::serialize_message(&mut buf, message)?;
        self.connection.enqueue_control_buffer(buf.freeze())
    }

    /// Send SUBSCRIBE
    pub fn subscribe(&self, message: SubscribeMessage) -> Result<(), MoqtError> {
        debug!(
            "Subscribing {} to {}/{}",
            message.subscribe_id, message.track_namespace, message.track_name
        );
        self.send_control(&message)
    }

    /// Send UNSUBSCRIBE
    pub fn unsubscribe(&self, subscribe_id: SubscribeId) -> Result<(), MoqtError> {
        self.send_control(&UnsubscribeMessage { subscribe_id })
    }

    /// Send TRACK_STATUS_REQUEST
    pub fn request_track_status(
        &self,
        track_namespace: TrackNamespace,
        track_name: &str,
    ) -> Result<(), MoqtError> {
        self.send_control(&TrackStatusRequestMessage {
            track_namespace,
            track_name: track_name.to_string(),
        })
    }

    /// Negotiated setup
    pub fn setup(&self) -> SetupState {
        self.connection.setup()
    }

    /// Close the connection without error
    pub fn close(&self) {
        self.connection
            .close(TerminationCode::NoError.code(), "client finished");
    }
}

/// Control stream handler on the client side
pub struct ClientControlHandler {
    supported_versions: Vec<Version>,
    events: EventSink,
    reassembler: Mutex<Reassembler>,
}

impl ClientControlHandler {
    fn new(config: &ClientConfig, events: EventSink) -> Self {
        Self {
            supported_versions: config.supported_versions.clone(),
            events,
            reassembler: Mutex::new(Reassembler::new(config.reassembler.clone())),
        }
    }
}

struct ClientDispatch<'a> {
    handler: &'a ClientControlHandler,
    connection: &'a ConnectionState,
}

impl ClientDispatch<'_> {
    fn require_setup(&self, what: &str) -> Result<(), MoqtError> {
        if !self.connection.is_setup_complete() {
            return Err(MoqtError::ProtocolViolation {
                reason: format!("{} before SERVER_SETUP", what),
            });
        }
        Ok(())
    }
}

impl MessageHandler for ClientDispatch<'_> {
    fn on_server_setup(&mut self, message: ServerSetupMessage) -> Result<(), MoqtError> {
        if self.connection.is_setup_complete() {
            return Err(MoqtError::ProtocolViolation {
                reason: "duplicate SERVER_SETUP".to_string(),
            });
        }
        let version = message.selected_version;
        if !self.handler.supported_versions.contains(&version) {
            return Err(MoqtError::VersionNegotiation {
                offered: self.handler.supported_versions.clone(),
            });
        }

        let peer_role = message.role();
        info!("Setup complete: version {:#x}, relay role {:?}", version, peer_role);
        self.connection.complete_setup(SetupState {
            version: Some(version),
            peer_role,
            path: None,
        });
        self.handler
            .events
            .emit(ClientEvent::SetupComplete { version, peer_role });
        Ok(())
    }

    fn on_subscribe_ok(&mut self, message: SubscribeOkMessage) -> Result<(), MoqtError> {
        self.require_setup("SUBSCRIBE_OK")?;
        self.handler.events.emit(ClientEvent::SubscribeOk(message));
        Ok(())
    }

    fn on_subscribe_error(&mut self, message: SubscribeErrorMessage) -> Result<(), MoqtError> {
        self.require_setup("SUBSCRIBE_ERROR")?;
        debug!(
            "Subscription {} rejected: {}",
            message.subscribe_id, message.reason
        );
        self.handler.events.emit(ClientEvent::SubscribeError(message));
        Ok(())
    }

    fn on_track_status(&mut self, message: TrackStatusMessage) -> Result<(), MoqtError> {
        self.require_setup("TRACK_STATUS")?;
        self.handler.events.emit(ClientEvent::TrackStatus(message));
        Ok(())
    }
}

impl StreamEventHandler for ClientControlHandler {
    fn on_event(
        &self,
        connection: &ConnectionState,
        stream: StreamHandle,
        event: StreamEvent,
    ) -> Result<(), MoqtError> {
        match event {
            StreamEvent::Receive(data) => {
                let mut dispatch = ClientDispatch {
                    handler: self,
                    connection,
                };
                self.reassembler.lock().append(&data, &mut dispatch)?;
                Ok(())
            }
            StreamEvent::PeerSendShutdown | StreamEvent::PeerSendAborted { .. } => {
                Err(MoqtError::ProtocolViolation {
                    reason: format!("Relay closed control {}", stream),
                })
            }
            StreamEvent::SendComplete { .. } | StreamEvent::ShutdownComplete => Ok(()),
        }
    }
}

/// MoQ client over a quinn connection
///
/// Dropping the client closes its connection.
#[derive(Debug)]
pub struct MoqClient {
    connection: quinn::Connection,
    session: Arc<ClientSession>,
    events: ClientEvents,
    driver: JoinHandle<Result<(), MoqtError>>,
}

impl MoqClient {
    /// Connect to a relay and start the session
    pub async fn connect(
        endpoint: &quinn::Endpoint,
        addr: SocketAddr,
        server_name: &str,
        config: ClientConfig,
        connection_config: ConnectionConfig,
    ) -> Result<Self, MoqtError> {
        info!("Connecting to {} ({})", server_name, addr);
        let connection = endpoint
            .connect(addr, server_name)
            .map_err(|e| MoqtError::Transport {
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| MoqtError::Transport {
                reason: e.to_string(),
            })?;
        Self::from_connection(connection, config, connection_config)
    }

    /// Start the session on an established connection
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_connection(
        connection: quinn::Connection,
        config: ClientConfig,
        connection_config: ConnectionConfig,
    ) -> Result<Self, MoqtError> {
        let (session, events, driver) =
            crate::transport::start_client(connection.clone(), config, connection_config)?;
        Ok(Self {
            connection,
            session,
            events,
            driver,
        })
    }

    /// Next event, `None` once the connection is gone and nothing is pending
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            reason = self.connection.closed() => {
                debug!("Connection closed: {}", reason);
                self.events.try_recv().ok()
            }
        }
    }

    /// Wait for SERVER_SETUP
    ///
    /// Other events received first are discarded.
    pub async fn wait_for_setup(&mut self) -> Result<SetupState, MoqtError> {
        while let Some(event) = self.next_event().await {
            match event {
                ClientEvent::SetupComplete { .. } => return Ok(self.session.setup()),
                other => debug!("Discarding {:?} received before setup", other),
            }
        }
        Err(MoqtError::ConnectionExpired)
    }

    /// Client session
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Send SUBSCRIBE
    pub fn subscribe(&self, message: SubscribeMessage) -> Result<(), MoqtError> {
        self.session.subscribe(message)
    }

    /// Send UNSUBSCRIBE
    pub fn unsubscribe(&self, subscribe_id: SubscribeId) -> Result<(), MoqtError> {
        self.session.unsubscribe(subscribe_id)
    }

    /// Send TRACK_STATUS_REQUEST
    pub fn request_track_status(
        &self,
        track_namespace: TrackNamespace,
        track_name: &str,
    ) -> Result<(), MoqtError> {
        self.session.request_track_status(track_namespace, track_name)
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.session.connection().stats()
    }

    /// Close the connection
    pub fn close(&self) {
        self.session.close();
    }
}

impl Drop for MoqClient {
    fn drop(&mut self) {
        self.session.close();
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moqt::{GroupObject, Message, SubscriptionFilter};
    use crate::transport::testing::{RecordingTransport, TransportCall};
    use bytes::Bytes;

    // RecordingTransport hands out 1 for the first stream it opens
    const CONTROL: StreamHandle = StreamHandle(1);

    struct Fixture {
        session: ClientSession,
        events: ClientEvents,
        transport: Arc<RecordingTransport>,
        connection: Arc<ConnectionState>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let connection = Arc::new(ConnectionState::new(
            transport.clone(),
            ConnectionConfig::default(),
        ));
        let (session, events) = ClientSession::start(
            ClientConfig {
                supported_versions: vec![5, 4],
                path: Some("/moq".to_string()),
                ..Default::default()
            },
            connection.clone(),
        )
        .unwrap();
        Fixture {
            session,
            events,
            transport,
            connection,
        }
    }

    fn frame(message: Message) -> Bytes {
        let mut buf = BytesMut::new();
        message.serialize(&mut buf).unwrap();
        buf.freeze()
    }

    fn deliver(f: &Fixture, message: Message) -> Result<(), MoqtError> {
        f.connection
            .on_stream_event(CONTROL, StreamEvent::Receive(frame(message)))
    }

    fn server_setup(version: Version) -> Message {
        Message::ServerSetup(ServerSetupMessage {
            selected_version: version,
            parameters: vec![Parameter::role(Role::Publisher)],
        })
    }

    fn sent(f: &Fixture) -> Vec<Message> {
        f.transport
            .sent_on(CONTROL)
            .into_iter()
            .map(|mut bytes| WireFormat::deserialize_message(&mut bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_start_sends_client_setup() {
        let f = fixture();
        assert_eq!(f.transport.calls()[0], TransportCall::OpenControl(CONTROL));
        match &sent(&f)[0] {
            Message::ClientSetup(setup) => {
                assert_eq!(setup.supported_versions, vec![5, 4]);
                assert_eq!(setup.role(), Some(Role::Subscriber));
                assert_eq!(setup.path(), Some("/moq"));
            }
            other => panic!("expected CLIENT_SETUP, got {:?}", other),
        }
        assert!(!f.connection.is_setup_complete());
    }

    #[test]
    fn test_server_setup_completes_handshake() {
        let mut f = fixture();
        deliver(&f, server_setup(4)).unwrap();

        assert_eq!(
            f.events.try_recv().unwrap(),
            ClientEvent::SetupComplete {
                version: 4,
                peer_role: Some(Role::Publisher),
            }
        );
        assert_eq!(f.session.setup().version, Some(4));

        let err = deliver(&f, server_setup(4)).unwrap_err();
        assert!(matches!(err, MoqtError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_unoffered_version_rejected() {
        let f = fixture();
        let err = deliver(&f, server_setup(9)).unwrap_err();
        assert_eq!(err, MoqtError::VersionNegotiation { offered: vec![5, 4] });
        assert!(!f.connection.is_setup_complete());
    }

    #[test]
    fn test_replies_before_setup_are_violations() {
        let f = fixture();
        let err = deliver(
            &f,
            Message::SubscribeOk(SubscribeOkMessage {
                subscribe_id: 1,
                expires_ms: 0,
                largest: None,
            }),
        )
        .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_subscribe_replies_become_events() {
        let mut f = fixture();
        deliver(&f, server_setup(5)).unwrap();
        let _ = f.events.try_recv();

        f.session
            .subscribe(SubscribeMessage {
                subscribe_id: 1,
                track_alias: 2,
                track_namespace: TrackNamespace::from(["live"]),
                track_name: "video".to_string(),
                filter: SubscriptionFilter::AbsoluteStart {
                    start: GroupObject::new(0, 0),
                },
                parameters: vec![],
            })
            .unwrap();
        assert!(matches!(&sent(&f)[1], Message::Subscribe(s) if s.subscribe_id == 1));

        let ok = SubscribeOkMessage {
            subscribe_id: 1,
            expires_ms: 0,
            largest: Some(GroupObject::new(0, 3)),
        };
        let error = SubscribeErrorMessage {
            subscribe_id: 2,
            error_code: 1,
            reason: "no such track".to_string(),
            track_alias: 7,
        };
        deliver(&f, Message::SubscribeOk(ok.clone())).unwrap();
        deliver(&f, Message::SubscribeError(error.clone())).unwrap();
        assert_eq!(f.events.try_recv().unwrap(), ClientEvent::SubscribeOk(ok));
        assert_eq!(f.events.try_recv().unwrap(), ClientEvent::SubscribeError(error));
    }

    #[test]
    fn test_objects_from_relay_streams_become_events() {
        let mut f = fixture();
        let stream = StreamHandle(50);
        f.connection
            .accept_data_stream(stream, f.session.data_stream_handler())
            .unwrap();

        let object = ObjectStreamMessage {
            subscribe_id: 1,
            track_alias: 2,
            group_id: 3,
            object_id: 4,
            publisher_priority: 0x80,
            payload: Bytes::from_static(b"frame"),
        };
        let data = frame(Message::ObjectStream(object.clone()));
        let (head, tail) = data.split_at(3);
        for part in [head, tail] {
            f.connection
                .on_stream_event(stream, StreamEvent::Receive(Bytes::copy_from_slice(part)))
                .unwrap();
        }

        assert_eq!(f.events.try_recv().unwrap(), ClientEvent::Object(object));
        assert_eq!(f.connection.stats().objects_received, 1);
    }

    #[test]
    fn test_relay_only_messages_rejected_on_client() {
        let f = fixture();
        deliver(&f, server_setup(5)).unwrap();
        let err = deliver(
            &f,
            Message::ClientSetup(ClientSetupMessage {
                supported_versions: vec![5],
                parameters: vec![],
            }),
        )
        .unwrap_err();
        assert!(matches!(err, MoqtError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_requests_after_close_fail() {
        let f = fixture();
        f.session.close();
        assert_eq!(
            f.transport.close_reason().map(|(code, _)| code),
            Some(TerminationCode::NoError.code())
        );
        assert_eq!(f.session.unsubscribe(1), Err(MoqtError::ConnectionExpired));
        assert_eq!(
            f.session
                .request_track_status(TrackNamespace::from(["live"]), "video"),
            Err(MoqtError::ConnectionExpired)
        );
    }

    #[test]
    fn test_empty_version_list_rejected() {
        let connection = Arc::new(ConnectionState::new(
            Arc::new(RecordingTransport::default()),
            ConnectionConfig::default(),
        ));
        let result = ClientSession::start(
            ClientConfig {
                supported_versions: vec![],
                ..Default::default()
            },
            connection.clone(),
        );
        assert!(matches!(result, Err(MoqtError::InvalidState { .. })));
        assert!(!connection.has_control_stream());
    }
}
