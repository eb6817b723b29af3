//! Shared fixtures for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use moqrelay_core::moqt::{
    ClientSetupMessage, MessageHandler, ObjectStreamMessage, ServerSetupMessage,
    SubscribeErrorMessage, SubscribeOkMessage, TrackStatusMessage, TrackStatusRequestMessage,
    UnsubscribeMessage,
};
use moqrelay_core::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One call made on the mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    OpenControl(StreamHandle),
    OpenData(StreamHandle),
    Send {
        stream: StreamHandle,
        data: Bytes,
        fin: bool,
    },
    Shutdown(StreamHandle),
    Close(u64),
}

/// Transport that records calls; completions are driven by the test
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    next_stream: Mutex<u64>,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Payload submitted on every data stream, in send order
    pub fn data_sends(&self) -> Vec<(StreamHandle, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send {
                    stream,
                    data,
                    fin: true,
                } => Some((stream, data)),
                _ => None,
            })
            .collect()
    }

    /// Buffers submitted on the control stream
    pub fn control_sends(&self) -> Vec<Bytes> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send {
                    data, fin: false, ..
                } => Some(data),
                _ => None,
            })
            .collect()
    }

    fn allocate(&self) -> StreamHandle {
        let mut next = self.next_stream.lock();
        *next += 1;
        StreamHandle(*next)
    }
}

impl StreamTransport for MockTransport {
    fn open_control_stream(&self) -> Result<StreamHandle, MoqtError> {
        let stream = self.allocate();
        self.calls.lock().push(Call::OpenControl(stream));
        Ok(stream)
    }

    fn open_data_stream(&self) -> Result<StreamHandle, MoqtError> {
        let stream = self.allocate();
        self.calls.lock().push(Call::OpenData(stream));
        Ok(stream)
    }

    fn send(&self, stream: StreamHandle, data: Bytes, fin: bool) -> Result<(), MoqtError> {
        self.calls.lock().push(Call::Send { stream, data, fin });
        Ok(())
    }

    fn shutdown_stream(&self, stream: StreamHandle) -> Result<(), MoqtError> {
        self.calls.lock().push(Call::Shutdown(stream));
        Ok(())
    }

    fn close(&self, code: u64, _reason: &str) {
        self.calls.lock().push(Call::Close(code));
    }
}

/// Handler that ignores control stream events
pub struct NullHandler;

impl StreamEventHandler for NullHandler {
    fn on_event(
        &self,
        _connection: &ConnectionState,
        _stream: StreamHandle,
        _event: StreamEvent,
    ) -> Result<(), MoqtError> {
        Ok(())
    }
}

/// Connection over a mock transport with its control stream established
pub fn connection(max_data_streams: usize) -> (Arc<MockTransport>, Arc<ConnectionState>) {
    let transport = Arc::new(MockTransport::default());
    let connection = Arc::new(ConnectionState::new(
        transport.clone(),
        ConnectionConfig {
            max_data_streams,
            ..Default::default()
        },
    ));
    connection
        .establish_control_stream(Arc::new(NullHandler))
        .unwrap();
    (transport, connection)
}

/// Collects every decoded message
#[derive(Debug, Default)]
pub struct Collector {
    pub messages: Vec<Message>,
}

impl MessageHandler for Collector {
    fn on_object_stream(&mut self, message: ObjectStreamMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::ObjectStream(message));
        Ok(())
    }

    fn on_subscribe(&mut self, message: SubscribeMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::Subscribe(message));
        Ok(())
    }

    fn on_subscribe_ok(&mut self, message: SubscribeOkMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::SubscribeOk(message));
        Ok(())
    }

    fn on_subscribe_error(&mut self, message: SubscribeErrorMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::SubscribeError(message));
        Ok(())
    }

    fn on_unsubscribe(&mut self, message: UnsubscribeMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::Unsubscribe(message));
        Ok(())
    }

    fn on_track_status_request(
        &mut self,
        message: TrackStatusRequestMessage,
    ) -> Result<(), MoqtError> {
        self.messages.push(Message::TrackStatusRequest(message));
        Ok(())
    }

    fn on_track_status(&mut self, message: TrackStatusMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::TrackStatus(message));
        Ok(())
    }

    fn on_client_setup(&mut self, message: ClientSetupMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::ClientSetup(message));
        Ok(())
    }

    fn on_server_setup(&mut self, message: ServerSetupMessage) -> Result<(), MoqtError> {
        self.messages.push(Message::ServerSetup(message));
        Ok(())
    }
}

/// Decode one complete framed message
pub fn decode(mut data: Bytes) -> Message {
    WireFormat::deserialize_message(&mut data).unwrap()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
