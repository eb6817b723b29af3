//! Configuration types and defaults

use crate::RelayError;
use moqrelay_core::moqt::Version;
use moqrelay_core::{
    ConnectionConfig, ReassemblerConfig, Role, SessionConfig, SubscriptionConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Role the relay announces in SERVER_SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    /// Serves objects only
    Publisher,
    /// Accepts objects only
    Subscriber,
    /// Both directions
    PubSub,
}

impl From<RelayRole> for Role {
    fn from(role: RelayRole) -> Self {
        match role {
            RelayRole::Publisher => Role::Publisher,
            RelayRole::Subscriber => Role::Subscriber,
            RelayRole::PubSub => Role::PubSub,
        }
    }
}

/// Relay configuration
///
/// Durations are expressed in milliseconds so the struct maps directly to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Versions accepted during setup, in preference order
    pub supported_versions: Vec<Version>,
    /// Announced role
    pub role: RelayRole,
    /// Concurrent outbound data streams per connection
    pub max_data_streams: usize,
    /// Control buffers that may wait for the control stream
    pub control_buffer_capacity: usize,
    /// Largest accepted control message body
    pub max_message_size: usize,
    /// Subscription worker threads
    pub worker_threads: usize,
    /// Sleep between idle worker passes
    pub idle_backoff_ms: u64,
    /// How long a subscription may wait for an unpublished object; `None` waits forever
    pub live_tail_timeout_ms: Option<u64>,
    /// Queued object buffers per connection at which subscriptions pause
    pub max_queued_objects: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let connection = ConnectionConfig::default();
        let subscription = SubscriptionConfig::default();
        Self {
            supported_versions: session.supported_versions,
            role: RelayRole::Publisher,
            max_data_streams: connection.max_data_streams,
            control_buffer_capacity: connection.control_buffer_capacity,
            max_message_size: session.reassembler.max_message_size,
            worker_threads: subscription.worker_threads,
            idle_backoff_ms: subscription.idle_backoff.as_millis() as u64,
            live_tail_timeout_ms: subscription
                .live_tail_timeout
                .map(|timeout| timeout.as_millis() as u64),
            max_queued_objects: subscription.max_queued_objects,
        }
    }
}

impl RelayConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.supported_versions.is_empty() {
            return Err(RelayError::Config {
                reason: "supported_versions must not be empty".to_string(),
            });
        }
        if self.max_data_streams == 0 {
            return Err(RelayError::Config {
                reason: "max_data_streams must be at least 1".to_string(),
            });
        }
        if self.worker_threads == 0 {
            return Err(RelayError::Config {
                reason: "worker_threads must be at least 1".to_string(),
            });
        }
        if self.max_queued_objects == 0 {
            return Err(RelayError::Config {
                reason: "max_queued_objects must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Per-connection settings
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_data_streams: self.max_data_streams,
            control_buffer_capacity: self.control_buffer_capacity,
        }
    }

    /// Control session settings
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            supported_versions: self.supported_versions.clone(),
            role: self.role.into(),
            reassembler: ReassemblerConfig {
                max_message_size: self.max_message_size,
            },
        }
    }

    /// Worker pool settings
    pub fn subscription(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            worker_threads: self.worker_threads,
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
            live_tail_timeout: self.live_tail_timeout_ms.map(Duration::from_millis),
            max_queued_objects: self.max_queued_objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_core() {
        let config = RelayConfig::default();
        assert_eq!(config.max_data_streams, 8);
        assert_eq!(config.control_buffer_capacity, 1024);
        assert_eq!(config.idle_backoff_ms, 1);
        assert_eq!(config.live_tail_timeout_ms, Some(30_000));
        assert_eq!(config.max_queued_objects, 64);
        assert_eq!(config.subscription().max_queued_objects, 64);
        assert_eq!(config.subscription().idle_backoff, Duration::from_millis(1));
        assert_eq!(config.session().role, Role::Publisher);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RelayConfig {
            supported_versions: vec![1, 2],
            role: RelayRole::PubSub,
            live_tail_timeout_ms: None,
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"pubsub\""));
        assert_eq!(RelayConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RelayConfig::from_json(r#"{ "max_data_streams": 2 }"#).unwrap();
        assert_eq!(config.max_data_streams, 2);
        assert_eq!(config.worker_threads, RelayConfig::default().worker_threads);
        assert_eq!(config.connection().max_data_streams, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            RelayConfig::from_json(r#"{ "supported_versions": [] }"#),
            Err(RelayError::Config { .. })
        ));
        assert!(matches!(
            RelayConfig::from_json(r#"{ "max_queued_objects": 0 }"#),
            Err(RelayError::Config { .. })
        ));
        assert!(matches!(
            RelayConfig::from_json("not json"),
            Err(RelayError::Json(_))
        ));
    }
}
