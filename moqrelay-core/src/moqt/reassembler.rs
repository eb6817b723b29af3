//! Streaming message reassembly
//!
//! Transport fragments arrive at arbitrary boundaries. The reassembler keeps every
//! byte in a single `BytesMut` and runs a two-state machine:
//! - `WaitingForHeader`: need the `{type, length}` varint pair
//! - `WaitingForBody`: header parsed, need `length` more bytes
//!
//! Each complete frame is decoded and dispatched to a [`MessageHandler`].

use super::messages::{Message, MessageHandler};
use super::wire_format::WireFormat;
use crate::error::MoqtError;
use bytes::BytesMut;
use tracing::trace;

/// Reassembler limits
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Largest accepted body length in bytes
    pub max_message_size: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForBody { message_type: u64, body_len: usize },
}

/// Rebuilds framed messages from a fragmented byte stream
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    state: State,
    max_message_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::WaitingForHeader,
            max_message_size: config.max_message_size,
        }
    }

    /// Append a fragment and dispatch every message it completes
    ///
    /// Returns the number of messages dispatched. A decode error consumes the
    /// offending frame; a handler error stops dispatch and is returned as is.
    pub fn append<H: MessageHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<usize, MoqtError> {
        self.buffer.extend_from_slice(data);

        let mut dispatched = 0;
        while let Some(message) = self.next_message()? {
            trace!("Reassembled {:?} message", message.message_type());
            message.dispatch(handler)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Extract the next complete message, if one is buffered
    pub fn next_message(&mut self) -> Result<Option<Message>, MoqtError> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some((message_type, type_len)) = WireFormat::peek_varint(&self.buffer)
                    else {
                        return Ok(None);
                    };
                    let Some((body_len, len_len)) =
                        WireFormat::peek_varint(&self.buffer[type_len..])
                    else {
                        return Ok(None);
                    };

                    if body_len > self.max_message_size as u64 {
                        return Err(MoqtError::MessageTooLarge {
                            size: body_len,
                            max: self.max_message_size,
                        });
                    }

                    let _ = self.buffer.split_to(type_len + len_len);
                    self.state = State::WaitingForBody {
                        message_type,
                        body_len: body_len as usize,
                    };
                }
                State::WaitingForBody {
                    message_type,
                    body_len,
                } => {
                    if self.buffer.len() < body_len {
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(body_len).freeze();
                    self.state = State::WaitingForHeader;
                    return Message::decode(message_type, body).map(Some);
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of a dispatched message
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no partial message is pending
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moqt::messages::{ClientSetupMessage, UnsubscribeMessage};
    use bytes::Bytes;

    #[derive(Default)]
    struct Collect(Vec<Message>);

    impl MessageHandler for Collect {
        fn on_client_setup(&mut self, message: ClientSetupMessage) -> Result<(), MoqtError> {
            self.0.push(Message::ClientSetup(message));
            Ok(())
        }

        fn on_unsubscribe(&mut self, message: UnsubscribeMessage) -> Result<(), MoqtError> {
            self.0.push(Message::Unsubscribe(message));
            Ok(())
        }
    }

    fn frame(message: &Message) -> Bytes {
        let mut buf = BytesMut::new();
        message.serialize(&mut buf).unwrap();
        buf.freeze()
    }

    fn setup() -> Message {
        Message::ClientSetup(ClientSetupMessage {
            supported_versions: vec![0x12345678, 0x87654321],
            parameters: vec![],
        })
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = frame(&setup());
        let mut reassembler = Reassembler::default();
        let mut handler = Collect::default();

        for (i, byte) in bytes.iter().enumerate() {
            let dispatched = reassembler.append(&[*byte], &mut handler).unwrap();
            let expected = usize::from(i == bytes.len() - 1);
            assert_eq!(dispatched, expected);
        }
        assert_eq!(handler.0, vec![setup()]);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_several_messages_in_one_fragment() {
        let unsubscribe = Message::Unsubscribe(UnsubscribeMessage { subscribe_id: 4 });
        let mut data = BytesMut::new();
        data.extend_from_slice(&frame(&setup()));
        data.extend_from_slice(&frame(&unsubscribe));
        // Start of a third message
        data.extend_from_slice(&[0x0A]);

        let mut reassembler = Reassembler::default();
        let mut handler = Collect::default();
        assert_eq!(reassembler.append(&data, &mut handler).unwrap(), 2);
        assert_eq!(handler.0, vec![setup(), unsubscribe]);
        assert_eq!(reassembler.buffered_len(), 1);
        assert!(!reassembler.is_empty());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            max_message_size: 8,
        });
        let mut handler = Collect::default();
        let err = reassembler.append(&[0x40, 0x40, 0x20], &mut handler).unwrap_err();
        assert_eq!(err, MoqtError::MessageTooLarge { size: 32, max: 8 });
    }

    #[test]
    fn test_bad_frame_is_consumed() {
        let mut data = BytesMut::new();
        // Unknown type with a one-byte body
        data.extend_from_slice(&[0x3F, 0x01, 0xAA]);
        data.extend_from_slice(&frame(&setup()));

        let mut reassembler = Reassembler::default();
        let mut handler = Collect::default();
        let err = reassembler.append(&data, &mut handler).unwrap_err();
        assert_eq!(err, MoqtError::UnknownMessageType { message_type: 0x3F });

        // The following frame is still intact
        assert_eq!(reassembler.append(&[], &mut handler).unwrap(), 1);
        assert_eq!(handler.0, vec![setup()]);
    }
}
