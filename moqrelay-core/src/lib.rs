//! # moqrelay core
//!
//! MoQ Transport relay internals: the wire codec, per-connection stream
//! admission, the worker pool that fulfills subscriptions from a
//! [`ContentStore`], and a subscriber client.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod content_store;
pub mod error;
pub mod moqt;
pub mod session;
pub mod subscription;
pub mod transport;

// Re-export main types
pub use client::{ClientConfig, ClientEvent, ClientEvents, ClientSession, MoqClient};
pub use connection::{
    ConnectionArena, ConnectionConfig, ConnectionHandle, ConnectionState, ConnectionStats,
    DataStreamHandler, ObjectSink, PeerDataStreamHandler, SetupState, StreamEvent,
    StreamEventHandler, StreamHandle, StreamRole,
};
pub use content_store::{ContentStore, MemoryContentStore, ObjectLookup};
pub use error::MoqtError;
pub use moqt::{
    Message, MessageType, ObjectIdentifier, Reassembler, ReassemblerConfig, Role,
    SubscribeMessage, SubscriptionFilter, TrackNamespace, WireFormat, WireMessage,
};
pub use session::{ControlStreamHandler, ServerSession, SessionConfig, TerminationCode};
pub use subscription::{
    FulfillOutcome, SubscriptionConfig, SubscriptionManager, SubscriptionState,
};
pub use transport::{serve_connection, start_client, QuinnTransport, StreamTransport};
