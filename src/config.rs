//! Configuration for the replication engine.
//!
//! Configuration is passed to
//! [`ReplicationEngine::new()`](crate::ReplicationEngine::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node_id: String      # This node's unique ID
//! ├── peer: PeerConfig           # The single remote peer to push to
//! │   ├── node_id / address
//! │   └── credentials            # Presented during the handshake
//! ├── inbound: InboundConfig     # Listener for the peer's pushes
//! │   ├── listen_addr
//! │   └── credentials            # Required from the connecting peer
//! ├── queue: QueueConfig         # Bounded outbound queue
//! └── delivery: DeliveryConfig   # Per-operation retry policy
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "graph.node.a"
//!
//! peer:
//!   node_id: "graph.node.b"
//!   address: "peer-b.example.com:7688"
//!   credentials:
//!     username: "replicator"
//!     password: "s3cret"
//!
//! inbound:
//!   listen_addr: "0.0.0.0:7688"
//!   credentials:
//!     username: "replicator"
//!     password: "s3cret"
//!
//! queue:
//!   capacity: 1024
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The identity of the local node running this engine.
    /// Stamped onto every outbound operation as its source.
    pub local_node_id: String,

    /// The remote peer this engine pushes captured changes to.
    pub peer: PeerConfig,

    /// Listener settings for the peer's inbound pushes.
    pub inbound: InboundConfig,

    /// Bounded outbound queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Per-operation delivery retry policy.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// How long `stop()` waits for the outbound queue to drain before
    /// closing the connection anyway. Duration string, e.g. "5s".
    #[serde(default = "default_stop_drain_timeout")]
    pub stop_drain_timeout: String,
}

fn default_stop_drain_timeout() -> String {
    "5s".to_string()
}

impl ReplicationConfig {
    /// Parse the stop drain timeout, falling back to 5 seconds.
    pub fn stop_drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stop_drain_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Minimal config for tests: loopback peer, fast retries, small queue.
    pub fn for_testing(local_node_id: &str, peer_address: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            peer: PeerConfig::for_testing("test-peer", peer_address),
            inbound: InboundConfig::for_testing(),
            queue: QueueConfig { capacity: 64 },
            delivery: DeliveryConfig::for_testing(),
            stop_drain_timeout: "2s".to_string(),
        }
    }
}

// =============================================================================
// PeerConfig: the remote node we push to
// =============================================================================

/// Credentials presented (outbound) or required (inbound) during the
/// connection handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn for_testing() -> Self {
        Self {
            username: "replicator".to_string(),
            password: "replicator-secret".to_string(),
        }
    }
}

/// Configuration for the single remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's unique node ID (for logging and handshake verification).
    pub node_id: String,

    /// TCP address of the peer's inbound listener.
    /// Example: `"peer-b.example.com:7688"`
    pub address: String,

    /// Credentials presented to the peer during the handshake.
    pub credentials: Credentials,

    /// Timeout for each individual connection attempt.
    /// Duration string, e.g. "5s".
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

impl PeerConfig {
    /// Parse the connect timeout, falling back to 5 seconds.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Create a peer config for testing.
    pub fn for_testing(node_id: &str, address: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            credentials: Credentials::for_testing(),
            connect_timeout: "500ms".to_string(),
        }
    }
}

// =============================================================================
// InboundConfig: listener for the peer's pushes
// =============================================================================

/// Inbound listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Address to bind the inbound listener on.
    /// Port 0 picks an ephemeral port (tests).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Credentials a connecting peer must present. A mismatch rejects
    /// the connection during the handshake.
    pub credentials: Credentials,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7688".to_string()
}

impl InboundConfig {
    pub fn for_testing() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            credentials: Credentials::for_testing(),
        }
    }
}

// =============================================================================
// QueueConfig: bounded outbound queue
// =============================================================================

/// Bounded outbound queue settings.
///
/// The capture listener enqueues without blocking; when the queue is
/// full, events are dropped and the overflow is surfaced on the engine
/// status rather than stalling the commit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum operations buffered between capture and dispatch.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

// =============================================================================
// DeliveryConfig: per-operation retry policy
// =============================================================================

/// Per-operation delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Send attempts per operation before the dispatcher declares
    /// delivery failed and falls back to a full reconnect.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry. Duration string, e.g. "100ms".
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    /// Ceiling for exponential backoff. Duration string, e.g. "30s".
    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Timeout for a single send attempt. Duration string, e.g. "5s".
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_send_timeout() -> String {
    "5s".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: "100ms".to_string(),
            max_delay: "30s".to_string(),
            backoff_factor: 2.0,
            send_timeout: "5s".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Build the retry policy used by the dispatcher for one operation.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_delay)
                .unwrap_or(Duration::from_millis(100)),
            max_delay: humantime::parse_duration(&self.max_delay)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: self.backoff_factor,
            connection_timeout: humantime::parse_duration(&self.send_timeout)
                .unwrap_or(Duration::from_secs(5)),
        }
    }

    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
            send_timeout: "500ms".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_config_defaults() {
        let peer = PeerConfig::for_testing("node-b", "127.0.0.1:7688");
        assert_eq!(peer.node_id, "node-b");
        assert_eq!(peer.address, "127.0.0.1:7688");
        assert_eq!(peer.credentials, Credentials::for_testing());
    }

    #[test]
    fn test_connect_timeout_parsing() {
        let peer = PeerConfig {
            connect_timeout: "10s".to_string(),
            ..PeerConfig::for_testing("n", "addr")
        };
        assert_eq!(peer.connect_timeout_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_connect_timeout_invalid_fallback() {
        let peer = PeerConfig {
            connect_timeout: "invalid".to_string(),
            ..PeerConfig::for_testing("n", "addr")
        };
        assert_eq!(peer.connect_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_queue_config_default() {
        assert_eq!(QueueConfig::default().capacity, 1024);
    }

    #[test]
    fn test_delivery_retry_config() {
        let delivery = DeliveryConfig {
            max_attempts: 7,
            initial_delay: "50ms".to_string(),
            max_delay: "2s".to_string(),
            backoff_factor: 3.0,
            send_timeout: "1s".to_string(),
        };
        let retry = delivery.retry_config();
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
        assert_eq!(retry.backoff_factor, 3.0);
        assert_eq!(retry.connection_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_stop_drain_timeout_parsing() {
        let config = ReplicationConfig::for_testing("node-a", "127.0.0.1:1");
        assert_eq!(config.stop_drain_timeout_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplicationConfig::for_testing("node-a", "127.0.0.1:9999");
        assert_eq!(config.local_node_id, "node-a");
        assert_eq!(config.peer.address, "127.0.0.1:9999");
        assert_eq!(config.inbound.listen_addr, "127.0.0.1:0");
        assert_eq!(config.queue.capacity, 64);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig::for_testing("node-roundtrip", "127.0.0.1:7688");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.local_node_id, "node-roundtrip");
        assert_eq!(parsed.peer.address, "127.0.0.1:7688");
        assert_eq!(parsed.delivery.max_attempts, 3);
    }

    #[test]
    fn test_config_minimal_deserialization_uses_defaults() {
        let json = r#"{
            "local_node_id": "node-a",
            "peer": {
                "node_id": "node-b",
                "address": "127.0.0.1:7688",
                "credentials": {"username": "u", "password": "p"}
            },
            "inbound": {
                "credentials": {"username": "u", "password": "p"}
            }
        }"#;
        let config: ReplicationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.capacity, 1024);
        assert_eq!(config.delivery.max_attempts, 5);
        assert_eq!(config.inbound.listen_addr, "0.0.0.0:7688");
        assert_eq!(config.stop_drain_timeout_duration(), Duration::from_secs(5));
    }
}
