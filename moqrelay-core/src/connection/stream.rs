//! Per-stream state and typed event handlers
//!
//! Each registered stream is bound to a [`StreamEventHandler`] for its role. The
//! transport reports what happened on a stream as a [`StreamEvent`]; the owning
//! [`ConnectionState`] looks up the bound handler and hands the event over.

use super::ConnectionState;
use crate::error::MoqtError;
use crate::moqt::{MessageHandler, ObjectStreamMessage, Reassembler, ReassemblerConfig};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Opaque transport stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// What a stream is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// The single bidirectional control stream
    Control,
    /// Outbound unidirectional stream carrying one object
    Data,
    /// Peer-initiated unidirectional stream
    PeerData,
}

/// Transport-level occurrence on a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Bytes arrived from the peer
    Receive(Bytes),
    /// A previously submitted send finished
    SendComplete {
        /// Send was cancelled before completion
        canceled: bool,
    },
    /// Peer finished its sending side
    PeerSendShutdown,
    /// Peer reset its sending side
    PeerSendAborted {
        /// Application error code from the reset
        error_code: u64,
    },
    /// Both directions are closed, the handle is no longer valid after this
    ShutdownComplete,
}

/// Role-specific reaction to stream events
pub trait StreamEventHandler: Send + Sync {
    /// Handle one event for `stream`, which belongs to `connection`
    fn on_event(
        &self,
        connection: &ConnectionState,
        stream: StreamHandle,
        event: StreamEvent,
    ) -> Result<(), MoqtError>;
}

/// A registered stream
#[derive(Clone)]
pub struct StreamState {
    /// Transport handle
    pub handle: StreamHandle,
    /// Stream role
    pub role: StreamRole,
    /// Handler bound at registration
    pub handler: Arc<dyn StreamEventHandler>,
    /// Buffer capacity reserved for this stream
    pub buffer_capacity: usize,
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamState")
            .field("handle", &self.handle)
            .field("role", &self.role)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish_non_exhaustive()
    }
}

/// Handler for outbound data streams
///
/// A completed send tears the stream down, which admits the next queued buffer.
#[derive(Debug, Default)]
pub struct DataStreamHandler;

impl StreamEventHandler for DataStreamHandler {
    fn on_event(
        &self,
        connection: &ConnectionState,
        stream: StreamHandle,
        event: StreamEvent,
    ) -> Result<(), MoqtError> {
        match event {
            StreamEvent::SendComplete { canceled } => {
                if canceled {
                    warn!("Send on data {} was cancelled", stream);
                }
                connection.delete_data_stream(stream)?;
            }
            StreamEvent::ShutdownComplete => {
                // Stream died before reporting completion
                if connection.has_data_stream(stream) {
                    connection.delete_data_stream(stream)?;
                }
            }
            StreamEvent::Receive(_) => {
                return Err(MoqtError::ProtocolViolation {
                    reason: format!("Data received on outbound {}", stream),
                });
            }
            StreamEvent::PeerSendShutdown | StreamEvent::PeerSendAborted { .. } => {
                trace!("Ignoring {:?} on outbound data {}", event, stream);
            }
        }
        Ok(())
    }
}

/// Receiver of objects decoded from peer data streams
pub trait ObjectSink: Send + Sync {
    /// Take one complete object
    fn on_object(&self, object: ObjectStreamMessage);
}

/// Handler for peer-initiated data streams
///
/// Objects are reassembled and counted, then handed to the sink if there is one.
/// The relay installs no sink and does not republish what it receives.
pub struct PeerDataStreamHandler {
    reassembler: Mutex<Reassembler>,
    sink: Option<Arc<dyn ObjectSink>>,
}

impl fmt::Debug for PeerDataStreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDataStreamHandler")
            .field("buffered", &self.reassembler.lock().buffered_len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl PeerDataStreamHandler {
    /// Create a handler with its own reassembler
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new(config)),
            sink: None,
        }
    }

    /// Create a handler that forwards every object to `sink`
    pub fn with_sink(config: ReassemblerConfig, sink: Arc<dyn ObjectSink>) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new(config)),
            sink: Some(sink),
        }
    }
}

struct ObjectCounter<'a> {
    connection: &'a ConnectionState,
    sink: Option<&'a dyn ObjectSink>,
}

impl MessageHandler for ObjectCounter<'_> {
    fn on_object_stream(&mut self, message: ObjectStreamMessage) -> Result<(), MoqtError> {
        debug!(
            "Received object {}/{} ({} bytes) for subscription {}",
            message.group_id,
            message.object_id,
            message.payload.len(),
            message.subscribe_id
        );
        self.connection.record_object_received();
        if let Some(sink) = self.sink {
            sink.on_object(message);
        }
        Ok(())
    }
}

impl StreamEventHandler for PeerDataStreamHandler {
    fn on_event(
        &self,
        connection: &ConnectionState,
        stream: StreamHandle,
        event: StreamEvent,
    ) -> Result<(), MoqtError> {
        match event {
            StreamEvent::Receive(data) => {
                let mut counter = ObjectCounter {
                    connection,
                    sink: self.sink.as_deref(),
                };
                self.reassembler.lock().append(&data, &mut counter)?;
            }
            StreamEvent::PeerSendShutdown => {
                if !self.reassembler.lock().is_empty() {
                    return Err(MoqtError::ProtocolViolation {
                        reason: format!("Peer {} finished mid-message", stream),
                    });
                }
            }
            StreamEvent::PeerSendAborted { error_code } => {
                debug!("Peer aborted {} with code {}", stream, error_code);
            }
            StreamEvent::SendComplete { .. } | StreamEvent::ShutdownComplete => {}
        }
        Ok(())
    }
}
