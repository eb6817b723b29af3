//! Transport contract and the quinn-backed implementation
//!
//! [`StreamTransport`] is everything the connection layer needs from QUIC. Calls
//! return immediately; completion is reported later as a [`StreamEvent`] routed
//! through [`ConnectionState::on_stream_event`].
//!
//! [`QuinnTransport`] runs one writer task per outbound stream and one reader task
//! per inbound stream. [`serve_connection`] owns the mapping from a quinn
//! connection to its [`ConnectionHandle`] in the arena, and [`start_client`] does
//! the same for the dialing side; nothing below this module sees transport
//! objects.

use crate::client::{ClientConfig, ClientEvents, ClientSession};
use crate::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionState, PeerDataStreamHandler, StreamEvent,
    StreamHandle,
};
use crate::error::MoqtError;
use crate::session::{handle_stream_error, ServerSession, TerminationCode};
use bytes::Bytes;
use parking_lot::Mutex;
use quinn::{Connection, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Largest chunk handed to the reassembler per read
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Stream operations the connection layer relies on
pub trait StreamTransport: Send + Sync + fmt::Debug {
    /// Open the bidirectional control stream
    fn open_control_stream(&self) -> Result<StreamHandle, MoqtError>;

    /// Open a unidirectional data stream
    fn open_data_stream(&self) -> Result<StreamHandle, MoqtError>;

    /// Submit `data` on `stream`, finishing the stream when `fin` is set
    fn send(&self, stream: StreamHandle, data: Bytes, fin: bool) -> Result<(), MoqtError>;

    /// Abort the sending side of `stream`
    fn shutdown_stream(&self, stream: StreamHandle) -> Result<(), MoqtError>;

    /// Close the whole connection
    fn close(&self, code: u64, reason: &str);
}

type EventSender = mpsc::UnboundedSender<(StreamHandle, StreamEvent)>;
type EventReceiver = mpsc::UnboundedReceiver<(StreamHandle, StreamEvent)>;

#[derive(Debug)]
enum WriteCommand {
    Data { data: Bytes, fin: bool },
    Shutdown,
}

/// [`StreamTransport`] over a quinn connection
pub struct QuinnTransport {
    connection: Connection,
    runtime: Handle,
    next_stream: AtomicU64,
    writers: Mutex<HashMap<StreamHandle, mpsc::UnboundedSender<WriteCommand>>>,
    events: EventSender,
}

impl fmt::Debug for QuinnTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuinnTransport")
            .field("remote_address", &self.connection.remote_address())
            .field("open_writers", &self.writers.lock().len())
            .finish()
    }
}

impl QuinnTransport {
    /// Wrap a connection; must be called from within a tokio runtime
    pub fn new(connection: Connection, events: EventSender) -> Result<Self, MoqtError> {
        let runtime = Handle::try_current().map_err(|e| MoqtError::Transport {
            reason: format!("No tokio runtime: {}", e),
        })?;
        Ok(Self {
            connection,
            runtime,
            next_stream: AtomicU64::new(0),
            writers: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn allocate(&self) -> StreamHandle {
        StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    fn register_writer(&self, stream: StreamHandle) -> mpsc::UnboundedReceiver<WriteCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.lock().insert(stream, tx);
        rx
    }

    /// Reserve a handle for a peer stream before its tasks start
    pub fn allocate_handle(&self) -> StreamHandle {
        self.allocate()
    }

    /// Start reading and writing an accepted bidirectional stream
    pub fn start_bi(&self, stream: StreamHandle, send: SendStream, recv: RecvStream) {
        let commands = self.register_writer(stream);
        self.runtime
            .spawn(drive_writer(stream, send, commands, self.events.clone()));
        self.runtime
            .spawn(drive_reader(stream, recv, self.events.clone(), false));
    }

    /// Start reading an accepted unidirectional stream
    pub fn start_uni(&self, stream: StreamHandle, recv: RecvStream) {
        self.runtime
            .spawn(drive_reader(stream, recv, self.events.clone(), true));
    }
}

impl StreamTransport for QuinnTransport {
    fn open_control_stream(&self) -> Result<StreamHandle, MoqtError> {
        let stream = self.allocate();
        let commands = self.register_writer(stream);
        let connection = self.connection.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            match connection.open_bi().await {
                Ok((send, recv)) => {
                    tokio::spawn(drive_reader(stream, recv, events.clone(), false));
                    drive_writer(stream, send, commands, events).await;
                }
                Err(e) => {
                    warn!("Failed to open control stream: {}", e);
                    let _ = events.send((stream, StreamEvent::ShutdownComplete));
                }
            }
        });
        Ok(stream)
    }

    fn open_data_stream(&self) -> Result<StreamHandle, MoqtError> {
        let stream = self.allocate();
        let commands = self.register_writer(stream);
        let connection = self.connection.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            match connection.open_uni().await {
                Ok(send) => drive_writer(stream, send, commands, events).await,
                Err(e) => {
                    debug!("Failed to open data {}: {}", stream, e);
                    let _ = events.send((stream, StreamEvent::SendComplete { canceled: true }));
                }
            }
        });
        Ok(stream)
    }

    fn send(&self, stream: StreamHandle, data: Bytes, fin: bool) -> Result<(), MoqtError> {
        let mut writers = self.writers.lock();
        let writer = writers
            .get(&stream)
            .ok_or(MoqtError::StreamNotFound { stream_id: stream.0 })?;
        writer
            .send(WriteCommand::Data { data, fin })
            .map_err(|_| MoqtError::Transport {
                reason: format!("Writer for {} has stopped", stream),
            })?;
        if fin {
            writers.remove(&stream);
        }
        Ok(())
    }

    fn shutdown_stream(&self, stream: StreamHandle) -> Result<(), MoqtError> {
        let writer = self
            .writers
            .lock()
            .remove(&stream)
            .ok_or(MoqtError::StreamNotFound { stream_id: stream.0 })?;
        // Writer may already be gone, the stream is shut either way
        let _ = writer.send(WriteCommand::Shutdown);
        Ok(())
    }

    fn close(&self, code: u64, reason: &str) {
        let code = VarInt::from_u64(code).unwrap_or(VarInt::from_u32(0x1));
        self.connection.close(code, reason.as_bytes());
    }
}

async fn drive_writer(
    stream: StreamHandle,
    mut send: SendStream,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: EventSender,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Data { data, fin } => {
                if let Err(e) = send.write_all(&data).await {
                    debug!("Write on {} failed: {}", stream, e);
                    let _ = events.send((stream, StreamEvent::SendComplete { canceled: true }));
                    return;
                }
                if fin {
                    if let Err(e) = send.finish() {
                        debug!("Finishing {} failed: {}", stream, e);
                    }
                }
                trace!("Wrote {} bytes on {}", data.len(), stream);
                if events
                    .send((stream, StreamEvent::SendComplete { canceled: false }))
                    .is_err()
                    || fin
                {
                    return;
                }
            }
            WriteCommand::Shutdown => {
                let _ = send.reset(VarInt::from_u32(0));
                let _ = events.send((stream, StreamEvent::ShutdownComplete));
                return;
            }
        }
    }
}

// A peer uni stream is over once its sending side ends
async fn drive_reader(
    stream: StreamHandle,
    mut recv: RecvStream,
    events: EventSender,
    release_on_end: bool,
) {
    read_until_end(stream, &mut recv, &events).await;
    if release_on_end {
        let _ = events.send((stream, StreamEvent::ShutdownComplete));
    }
}

async fn read_until_end(stream: StreamHandle, recv: &mut RecvStream, events: &EventSender) {
    loop {
        let event = match recv.read_chunk(READ_CHUNK_SIZE, true).await {
            Ok(Some(chunk)) => StreamEvent::Receive(chunk.bytes),
            Ok(None) => {
                let _ = events.send((stream, StreamEvent::PeerSendShutdown));
                return;
            }
            Err(quinn::ReadError::Reset(code)) => {
                let _ = events.send((
                    stream,
                    StreamEvent::PeerSendAborted {
                        error_code: code.into_inner(),
                    },
                ));
                return;
            }
            Err(e) => {
                debug!("Read on {} ended: {}", stream, e);
                return;
            }
        };
        if events.send((stream, event)).is_err() {
            return;
        }
    }
}

fn connection_error(e: quinn::ConnectionError) -> MoqtError {
    MoqtError::Transport {
        reason: e.to_string(),
    }
}

/// Serve one accepted QUIC connection until it closes
///
/// Registers the connection in the session's arena, binds the peer's first
/// bidirectional stream as the control stream and every unidirectional stream as
/// a peer data stream, then pumps stream events into the connection state. The
/// connection is removed from the arena on return.
pub async fn serve_connection(
    connection: Connection,
    session: Arc<ServerSession>,
    config: ConnectionConfig,
) -> Result<(), MoqtError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(QuinnTransport::new(connection.clone(), events_tx)?);
    let state = Arc::new(ConnectionState::new(transport.clone(), config));
    let handle = session.arena().insert(state);
    info!(
        "Serving {} from {}",
        handle,
        connection.remote_address()
    );

    let result = tokio::select! {
        reason = connection.closed() => {
            info!("Connection {} closed: {}", handle, reason);
            Ok(())
        }
        result = accept_streams(&connection, &transport, &session, handle) => result,
        _ = pump_events(&mut events_rx, &session, handle) => Ok(()),
    };

    session.arena().remove(handle);
    result
}

async fn accept_streams(
    connection: &Connection,
    transport: &QuinnTransport,
    session: &Arc<ServerSession>,
    handle: ConnectionHandle,
) -> Result<(), MoqtError> {
    loop {
        let Some(state) = session.arena().resolve(handle) else {
            return Ok(());
        };

        tokio::select! {
            bi = connection.accept_bi() => {
                let (send, recv) = bi.map_err(connection_error)?;
                let stream = transport.allocate_handle();
                if let Err(e) = state.accept_control_stream(stream, session.control_handler(handle)) {
                    session.handle_stream_error(&state, e.clone());
                    return Err(e);
                }
                transport.start_bi(stream, send, recv);
            }
            uni = connection.accept_uni() => {
                let recv = uni.map_err(connection_error)?;
                let stream = transport.allocate_handle();
                let handler = Arc::new(PeerDataStreamHandler::new(session.reassembler_config()));
                state.accept_data_stream(stream, handler)?;
                transport.start_uni(stream, recv);
            }
        }
    }
}

async fn pump_events(
    events: &mut EventReceiver,
    session: &Arc<ServerSession>,
    handle: ConnectionHandle,
) {
    while let Some((stream, event)) = events.recv().await {
        let Some(state) = session.arena().resolve(handle) else {
            break;
        };
        if let Err(e) = state.on_stream_event(stream, event) {
            session.handle_stream_error(&state, e);
        }
    }
}

/// Start the client side of an established QUIC connection
///
/// Opens the control stream and sends CLIENT_SETUP, then spawns the task that
/// accepts the relay's object streams and pumps stream events until the
/// connection closes. Must be called from within a tokio runtime.
pub fn start_client(
    connection: Connection,
    config: ClientConfig,
    connection_config: ConnectionConfig,
) -> Result<(Arc<ClientSession>, ClientEvents, JoinHandle<Result<(), MoqtError>>), MoqtError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(QuinnTransport::new(connection.clone(), events_tx)?);
    let state = Arc::new(ConnectionState::new(transport.clone(), connection_config));
    let (session, client_events) = ClientSession::start(config, state)?;
    let session = Arc::new(session);
    info!("Client session started to {}", connection.remote_address());

    let driver = tokio::spawn(drive_client(
        connection,
        transport,
        session.clone(),
        events_rx,
    ));
    Ok((session, client_events, driver))
}

async fn drive_client(
    connection: Connection,
    transport: Arc<QuinnTransport>,
    session: Arc<ClientSession>,
    mut events: EventReceiver,
) -> Result<(), MoqtError> {
    let state = session.connection().clone();
    let result = tokio::select! {
        reason = connection.closed() => {
            info!("Client connection closed: {}", reason);
            Ok(())
        }
        result = accept_object_streams(&connection, &transport, &session) => result,
        _ = pump_client_events(&mut events, &state) => Ok(()),
    };
    // Later requests see ConnectionExpired
    state.close(TerminationCode::NoError.code(), "connection ended");
    result
}

async fn accept_object_streams(
    connection: &Connection,
    transport: &QuinnTransport,
    session: &ClientSession,
) -> Result<(), MoqtError> {
    loop {
        let recv = connection.accept_uni().await.map_err(connection_error)?;
        let stream = transport.allocate_handle();
        session
            .connection()
            .accept_data_stream(stream, session.data_stream_handler())?;
        transport.start_uni(stream, recv);
    }
}

async fn pump_client_events(events: &mut EventReceiver, state: &ConnectionState) {
    while let Some((stream, event)) = events.recv().await {
        if let Err(e) = state.on_stream_event(stream, event) {
            handle_stream_error(state, e);
        }
        if state.is_closed() {
            break;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum TransportCall {
        OpenControl(StreamHandle),
        OpenData(StreamHandle),
        Send {
            stream: StreamHandle,
            data: Bytes,
            fin: bool,
        },
        Shutdown(StreamHandle),
        Close {
            code: u64,
            reason: String,
        },
    }

    #[derive(Debug, Default)]
    struct Recorded {
        calls: Vec<TransportCall>,
        next_stream: u64,
        fail_opens: bool,
    }

    /// Transport that records every call and completes nothing on its own
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        inner: Mutex<Recorded>,
    }

    impl RecordingTransport {
        pub(crate) fn calls(&self) -> Vec<TransportCall> {
            self.inner.lock().calls.clone()
        }

        pub(crate) fn fail_opens(&self, fail: bool) {
            self.inner.lock().fail_opens = fail;
        }

        pub(crate) fn sent_on(&self, stream: StreamHandle) -> Vec<Bytes> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    TransportCall::Send { stream: s, data, .. } if s == stream => Some(data),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn opened_data_streams(&self) -> Vec<StreamHandle> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    TransportCall::OpenData(stream) => Some(stream),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn close_reason(&self) -> Option<(u64, String)> {
            self.calls().into_iter().find_map(|call| match call {
                TransportCall::Close { code, reason } => Some((code, reason)),
                _ => None,
            })
        }

        fn open(&self, control: bool) -> Result<StreamHandle, MoqtError> {
            let mut inner = self.inner.lock();
            if inner.fail_opens {
                return Err(MoqtError::Transport {
                    reason: "open refused".to_string(),
                });
            }
            // Leave 0 free for peer-initiated control streams in tests
            inner.next_stream += 1;
            let stream = StreamHandle(inner.next_stream);
            inner.calls.push(if control {
                TransportCall::OpenControl(stream)
            } else {
                TransportCall::OpenData(stream)
            });
            Ok(stream)
        }
    }

    impl StreamTransport for RecordingTransport {
        fn open_control_stream(&self) -> Result<StreamHandle, MoqtError> {
            self.open(true)
        }

        fn open_data_stream(&self) -> Result<StreamHandle, MoqtError> {
            self.open(false)
        }

        fn send(&self, stream: StreamHandle, data: Bytes, fin: bool) -> Result<(), MoqtError> {
            self.inner
                .lock()
                .calls
                .push(TransportCall::Send { stream, data, fin });
            Ok(())
        }

        fn shutdown_stream(&self, stream: StreamHandle) -> Result<(), MoqtError> {
            self.inner.lock().calls.push(TransportCall::Shutdown(stream));
            Ok(())
        }

        fn close(&self, code: u64, reason: &str) {
            self.inner.lock().calls.push(TransportCall::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}
