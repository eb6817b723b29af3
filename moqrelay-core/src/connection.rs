//! Per-connection stream state and admission control
//!
//! A connection owns one control stream and a bounded set of outbound data
//! streams. Object buffers beyond the cap wait in a FIFO queue and are admitted as
//! earlier data streams complete.
//!
//! All mutable state sits behind one mutex. Transport calls are made while it is
//! held, which keeps sends in enqueue order; the transport never calls back
//! synchronously, so this cannot deadlock. Stream handlers are cloned out of the
//! lock before they run.

use crate::error::MoqtError;
use crate::moqt::{GroupId, Role, SubscribeId, TrackIdentifier, Version};
use crate::transport::StreamTransport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

pub mod arena;
pub mod stream;

pub use arena::{ConnectionArena, ConnectionHandle};
pub use stream::{
    DataStreamHandler, ObjectSink, PeerDataStreamHandler, StreamEvent, StreamEventHandler,
    StreamHandle, StreamRole, StreamState,
};

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum concurrently open outbound data streams
    pub max_data_streams: usize,
    /// Control buffers held while no control stream exists
    pub control_buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_data_streams: 8,
            control_buffer_capacity: 1024,
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Control buffers handed to the transport
    pub control_buffers_sent: u64,
    /// Data buffers handed to the transport
    pub data_buffers_sent: u64,
    /// Data buffers that had to wait for admission
    pub data_buffers_queued: u64,
    /// Highest number of simultaneously open data streams
    pub peak_data_streams: usize,
    /// Objects received on peer data streams
    pub objects_received: u64,
}

/// Outcome of the setup handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupState {
    /// Negotiated version
    pub version: Option<Version>,
    /// Role announced by the peer
    pub peer_role: Option<Role>,
    /// Path announced by the peer
    pub path: Option<String>,
}

/// Registration of one active subscription id
#[derive(Debug, Clone, Copy)]
struct SubscriptionSlot {
    token: u64,
    cancelled: bool,
}

#[derive(Default)]
struct ConnectionInner {
    control_stream: Option<StreamState>,
    control_established: bool,
    data_streams: BTreeMap<StreamHandle, StreamState>,
    peer_data_streams: HashMap<StreamHandle, StreamState>,
    control_queue: VecDeque<Bytes>,
    data_queue: VecDeque<Bytes>,
    current_groups: HashMap<TrackIdentifier, GroupId>,
    subscriptions: HashMap<SubscribeId, SubscriptionSlot>,
    next_subscription_token: u64,
    setup: SetupState,
    stats: ConnectionStats,
    closed: bool,
}

impl ConnectionInner {
    fn handler_for(&self, stream: StreamHandle) -> Option<StreamState> {
        if let Some(control) = &self.control_stream {
            if control.handle == stream {
                return Some(control.clone());
            }
        }
        self.data_streams
            .get(&stream)
            .or_else(|| self.peer_data_streams.get(&stream))
            .cloned()
    }

    fn remove_stream(&mut self, stream: StreamHandle) {
        if self
            .control_stream
            .as_ref()
            .is_some_and(|control| control.handle == stream)
        {
            self.control_stream = None;
        }
        self.data_streams.remove(&stream);
        self.peer_data_streams.remove(&stream);
    }
}

/// Session state of one peer connection
pub struct ConnectionState {
    transport: Arc<dyn StreamTransport>,
    config: ConnectionConfig,
    data_handler: Arc<dyn StreamEventHandler>,
    inner: Mutex<ConnectionInner>,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionState")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("control_stream", &inner.control_stream)
            .field("data_streams", &inner.data_streams.len())
            .field("queued_data_buffers", &inner.data_queue.len())
            .finish()
    }
}

impl ConnectionState {
    /// Create connection state over a transport
    pub fn new(transport: Arc<dyn StreamTransport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            data_handler: Arc::new(DataStreamHandler),
            inner: Mutex::new(ConnectionInner::default()),
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the outbound control stream
    ///
    /// Only one control stream may ever exist per connection.
    pub fn establish_control_stream(
        &self,
        handler: Arc<dyn StreamEventHandler>,
    ) -> Result<StreamHandle, MoqtError> {
        let mut inner = self.inner.lock();
        Self::ensure_no_control_stream(&inner)?;

        let stream = self.transport.open_control_stream().map_err(|e| {
            error!("Failed to open control stream: {}", e);
            e
        })?;
        self.register_control_stream(&mut inner, stream, handler)?;
        info!("Established control {}", stream);
        Ok(stream)
    }

    /// Register a control stream opened by the peer
    pub fn accept_control_stream(
        &self,
        stream: StreamHandle,
        handler: Arc<dyn StreamEventHandler>,
    ) -> Result<(), MoqtError> {
        let mut inner = self.inner.lock();
        Self::ensure_no_control_stream(&inner)?;
        self.register_control_stream(&mut inner, stream, handler)?;
        info!("Accepted control {}", stream);
        Ok(())
    }

    /// Register a data stream opened by the peer
    pub fn accept_data_stream(
        &self,
        stream: StreamHandle,
        handler: Arc<dyn StreamEventHandler>,
    ) -> Result<(), MoqtError> {
        let mut inner = self.inner.lock();
        inner.peer_data_streams.insert(
            stream,
            StreamState {
                handle: stream,
                role: StreamRole::PeerData,
                handler,
                buffer_capacity: 0,
            },
        );
        debug!("Accepted peer data {}", stream);
        Ok(())
    }

    fn ensure_no_control_stream(inner: &ConnectionInner) -> Result<(), MoqtError> {
        if inner.control_established {
            error!("Control stream already established for this connection");
            return Err(MoqtError::ControlStreamAlreadyEstablished);
        }
        Ok(())
    }

    fn register_control_stream(
        &self,
        inner: &mut ConnectionInner,
        stream: StreamHandle,
        handler: Arc<dyn StreamEventHandler>,
    ) -> Result<(), MoqtError> {
        inner.control_stream = Some(StreamState {
            handle: stream,
            role: StreamRole::Control,
            handler,
            buffer_capacity: self.config.control_buffer_capacity,
        });
        inner.control_established = true;
        // Flush anything queued before the stream existed
        self.flush_control_queue(inner)?;
        Ok(())
    }

    /// Queue a control message and send it if the control stream exists
    pub fn enqueue_control_buffer(&self, buffer: Bytes) -> Result<(), MoqtError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(MoqtError::ConnectionExpired);
        }
        if inner.control_stream.is_none()
            && inner.control_queue.len() >= self.config.control_buffer_capacity
        {
            return Err(MoqtError::InvalidState {
                expected: format!(
                    "at most {} pending control buffers",
                    self.config.control_buffer_capacity
                ),
                actual: format!("{} pending", inner.control_queue.len()),
            });
        }
        inner.control_queue.push_back(buffer);
        if inner.control_stream.is_some() {
            self.flush_control_queue(&mut inner)?;
        }
        Ok(())
    }

    /// Send all queued control buffers, returns how many were sent
    pub fn send_control_buffer(&self) -> Result<usize, MoqtError> {
        let mut inner = self.inner.lock();
        if inner.control_stream.is_none() {
            return Err(MoqtError::NoControlStream);
        }
        self.flush_control_queue(&mut inner)
    }

    fn flush_control_queue(&self, inner: &mut ConnectionInner) -> Result<usize, MoqtError> {
        let Some(stream) = inner.control_stream.as_ref().map(|s| s.handle) else {
            return Ok(0);
        };

        let mut sent = 0;
        while let Some(buffer) = inner.control_queue.pop_front() {
            self.transport.send(stream, buffer, false)?;
            inner.stats.control_buffers_sent += 1;
            sent += 1;
        }
        Ok(sent)
    }

    /// Queue an object buffer for delivery on its own data stream
    pub fn enqueue_data_buffer(&self, buffer: Bytes) -> Result<(), MoqtError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(MoqtError::ConnectionExpired);
        }
        inner.data_queue.push_back(buffer);
        if inner.data_streams.len() >= self.config.max_data_streams {
            inner.stats.data_buffers_queued += 1;
            trace!(
                "Data stream cap {} reached, {} buffers waiting",
                self.config.max_data_streams,
                inner.data_queue.len()
            );
        }
        self.admit_data_buffers(&mut inner)?;
        Ok(())
    }

    /// Open data streams for queued buffers while under the cap
    ///
    /// Returns the number of buffers sent.
    pub fn send_data_buffer(&self) -> Result<usize, MoqtError> {
        let mut inner = self.inner.lock();
        self.admit_data_buffers(&mut inner)
    }

    fn admit_data_buffers(&self, inner: &mut ConnectionInner) -> Result<usize, MoqtError> {
        let mut sent = 0;
        while inner.data_streams.len() < self.config.max_data_streams {
            let Some(buffer) = inner.data_queue.pop_front() else {
                break;
            };

            let stream = match self.transport.open_data_stream() {
                Ok(stream) => stream,
                Err(e) => {
                    // Keep the buffer at the head so ordering survives
                    inner.data_queue.push_front(buffer);
                    return Err(e);
                }
            };

            inner.data_streams.insert(
                stream,
                StreamState {
                    handle: stream,
                    role: StreamRole::Data,
                    handler: self.data_handler.clone(),
                    buffer_capacity: buffer.len(),
                },
            );
            inner.stats.peak_data_streams =
                inner.stats.peak_data_streams.max(inner.data_streams.len());

            if let Err(e) = self.transport.send(stream, buffer, true) {
                inner.data_streams.remove(&stream);
                return Err(e);
            }
            inner.stats.data_buffers_sent += 1;
            sent += 1;
        }
        Ok(sent)
    }

    /// Remove a completed data stream and admit queued buffers
    pub fn delete_data_stream(&self, stream: StreamHandle) -> Result<usize, MoqtError> {
        let mut inner = self.inner.lock();
        if inner.data_streams.remove(&stream).is_none() {
            return Err(MoqtError::StreamNotFound { stream_id: stream.0 });
        }
        trace!("Deleted data {}, {} still open", stream, inner.data_streams.len());
        self.admit_data_buffers(&mut inner)
    }

    /// Route a transport event to the handler bound to `stream`
    pub fn on_stream_event(&self, stream: StreamHandle, event: StreamEvent) -> Result<(), MoqtError> {
        let state = self
            .inner
            .lock()
            .handler_for(stream)
            .ok_or(MoqtError::StreamNotFound { stream_id: stream.0 })?;

        let shutdown = matches!(event, StreamEvent::ShutdownComplete);
        let result = state.handler.on_event(self, stream, event);
        if shutdown {
            self.inner.lock().remove_stream(stream);
        }
        result
    }

    /// Whether an outbound data stream is open
    pub fn has_data_stream(&self, stream: StreamHandle) -> bool {
        self.inner.lock().data_streams.contains_key(&stream)
    }

    /// Whether the control stream is registered
    pub fn has_control_stream(&self) -> bool {
        self.inner.lock().control_stream.is_some()
    }

    /// Number of open outbound data streams
    pub fn data_stream_count(&self) -> usize {
        self.inner.lock().data_streams.len()
    }

    /// Number of buffers waiting for a data stream
    pub fn queued_data_buffers(&self) -> usize {
        self.inner.lock().data_queue.len()
    }

    /// Last group delivered on `track` over this connection
    pub fn current_group(&self, track: TrackIdentifier) -> Option<GroupId> {
        self.inner.lock().current_groups.get(&track).copied()
    }

    /// Record the group most recently delivered on `track`
    pub fn set_current_group(&self, track: TrackIdentifier, group: GroupId) {
        self.inner.lock().current_groups.insert(track, group);
    }

    /// Register `subscribe_id` as active and return its token
    ///
    /// A later registration of the same id supersedes the earlier one.
    pub fn begin_subscription(&self, subscribe_id: SubscribeId) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_subscription_token += 1;
        let token = inner.next_subscription_token;
        if inner
            .subscriptions
            .insert(
                subscribe_id,
                SubscriptionSlot {
                    token,
                    cancelled: false,
                },
            )
            .is_some()
        {
            debug!("Subscription id {} reused while still active", subscribe_id);
        }
        token
    }

    /// Mark the active subscription `subscribe_id` as cancelled by the peer
    ///
    /// Returns false when no subscription with that id is active.
    pub fn cancel_subscription(&self, subscribe_id: SubscribeId) -> bool {
        match self.inner.lock().subscriptions.get_mut(&subscribe_id) {
            Some(slot) => {
                slot.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Whether the subscription registered under `token` must stop
    ///
    /// True once it is cancelled, superseded or released.
    pub fn is_cancelled(&self, subscribe_id: SubscribeId, token: u64) -> bool {
        !matches!(
            self.inner.lock().subscriptions.get(&subscribe_id),
            Some(slot) if slot.token == token && !slot.cancelled
        )
    }

    /// Release the registration made under `token`, freeing the id for reuse
    pub fn end_subscription(&self, subscribe_id: SubscribeId, token: u64) {
        let mut inner = self.inner.lock();
        if inner
            .subscriptions
            .get(&subscribe_id)
            .is_some_and(|slot| slot.token == token)
        {
            inner.subscriptions.remove(&subscribe_id);
        }
    }

    /// Number of registered subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Record the negotiated setup
    pub fn complete_setup(&self, setup: SetupState) {
        self.inner.lock().setup = setup;
    }

    /// Negotiated setup
    pub fn setup(&self) -> SetupState {
        self.inner.lock().setup.clone()
    }

    /// Whether the setup handshake completed
    pub fn is_setup_complete(&self) -> bool {
        self.inner.lock().setup.version.is_some()
    }

    pub(crate) fn record_object_received(&self) {
        self.inner.lock().stats.objects_received += 1;
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats.clone()
    }

    /// Close the connection with an application error code
    pub fn close(&self, code: u64, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.data_queue.clear();
        inner.control_queue.clear();
        info!("Closing connection: {} (code {})", reason, code);
        self.transport.close(code, reason);
    }

    /// Whether [`ConnectionState::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
