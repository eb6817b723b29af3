//! # moqrelay - MoQ Transport relay over QUIC
//!
//! moqrelay answers MoQ Transport subscriptions from a [`ContentStore`]. Clients
//! open a bidirectional control stream, negotiate a version with CLIENT_SETUP and
//! SUBSCRIBE to tracks; matching objects come back one per unidirectional data
//! stream, with a per-connection cap on concurrently open streams.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use moqrelay::{MemoryContentStore, MoqRelay, RelayConfig, TrackNamespace};
//! use std::sync::Arc;
//!
//! # async fn example(endpoint: quinn::Endpoint) -> Result<(), moqrelay::RelayError> {
//! moqrelay::logging::init_logging("info")?;
//!
//! let store = Arc::new(MemoryContentStore::new());
//! let track = store.register_track(TrackNamespace::from(["live"]), "video");
//! store.publish(track, 0, 0, &b"keyframe"[..])?;
//!
//! let relay = MoqRelay::new(RelayConfig::default(), store)?;
//! relay.serve(endpoint).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Subscribing
//!
//! [`MoqClient`] dials a relay, announces the Subscriber role and reports what
//! comes back as [`ClientEvent`]s.
//!
//! ```rust,no_run
//! use moqrelay::{
//!     ClientConfig, ClientEvent, ConnectionConfig, MoqClient, SubscribeMessage,
//!     SubscriptionFilter, TrackNamespace,
//! };
//!
//! # async fn example(endpoint: quinn::Endpoint) -> Result<(), moqrelay::RelayError> {
//! let addr = "127.0.0.1:4443".parse().unwrap();
//! let mut client = MoqClient::connect(
//!     &endpoint,
//!     addr,
//!     "localhost",
//!     ClientConfig::default(),
//!     ConnectionConfig::default(),
//! )
//! .await?;
//! client.wait_for_setup().await?;
//!
//! client.subscribe(SubscribeMessage {
//!     subscribe_id: 1,
//!     track_alias: 1,
//!     track_namespace: TrackNamespace::from(["live"]),
//!     track_name: "video".to_string(),
//!     filter: SubscriptionFilter::LatestGroup,
//!     parameters: vec![],
//! })?;
//! while let Some(event) = client.next_event().await {
//!     if let ClientEvent::Object(object) = event {
//!         println!("{}/{}: {} bytes", object.group_id, object.object_id, object.payload.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// Re-export core types for easy access
pub use moqrelay_core::moqt;
pub use moqrelay_core::{
    ClientConfig, ClientEvent, ConnectionConfig, ConnectionHandle, ContentStore,
    MemoryContentStore, Message, MoqClient, MoqtError, ObjectIdentifier, ObjectLookup, Role,
    ServerSession, SessionConfig, SubscribeMessage, SubscriptionConfig, SubscriptionFilter,
    TerminationCode, TrackNamespace, WireFormat,
};

pub mod config;
pub mod logging;

pub use config::{RelayConfig, RelayRole};

/// Errors surfaced by the relay facade
#[derive(Error, Debug)]
pub enum RelayError {
    /// Protocol or connection failure from the core
    #[error(transparent)]
    Moqt(#[from] MoqtError),

    /// Configuration could not be parsed
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is well formed but unusable
    #[error("Configuration error: {reason}")]
    Config {
        /// Error description
        reason: String,
    },

    /// Handshake with a client failed
    #[error("Connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),
}

/// Relay entry point
///
/// Cloning is cheap; clones share the session and the worker pool.
#[derive(Debug, Clone)]
pub struct MoqRelay {
    session: Arc<ServerSession>,
    connection_config: ConnectionConfig,
}

impl MoqRelay {
    /// Start the subscription workers and build the shared session
    pub fn new(config: RelayConfig, store: Arc<dyn ContentStore>) -> Result<Self, RelayError> {
        config.validate()?;

        let arena = Arc::new(moqrelay_core::ConnectionArena::new());
        let subscriptions = moqrelay_core::SubscriptionManager::new(
            store.clone(),
            arena.clone(),
            config.subscription(),
        )?;
        let session = ServerSession::new(config.session(), store, arena, subscriptions);

        info!(
            "Relay ready: versions {:x?}, role {:?}",
            config.supported_versions, config.role
        );
        Ok(Self {
            session: Arc::new(session),
            connection_config: config.connection(),
        })
    }

    /// Shared session state
    pub fn session(&self) -> &Arc<ServerSession> {
        &self.session
    }

    /// Number of connections currently served
    pub fn connection_count(&self) -> usize {
        self.session.arena().len()
    }

    /// Serve one established QUIC connection until it closes
    pub async fn accept(&self, connection: quinn::Connection) -> Result<(), RelayError> {
        moqrelay_core::serve_connection(
            connection,
            self.session.clone(),
            self.connection_config.clone(),
        )
        .await?;
        Ok(())
    }

    /// Accept connections from `endpoint` until it is closed
    ///
    /// Each connection is served on its own task.
    pub async fn serve(&self, endpoint: quinn::Endpoint) {
        info!("Listening on {:?}", endpoint.local_addr());
        while let Some(incoming) = endpoint.accept().await {
            let relay = self.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("Handshake failed: {}", e);
                        return;
                    }
                };
                let remote = connection.remote_address();
                match relay.accept(connection).await {
                    Ok(()) => debug!("Finished serving {}", remote),
                    Err(e) => warn!("Connection from {} ended with error: {}", remote, e),
                }
            });
        }
        info!("Endpoint closed, no longer accepting connections");
    }
}
