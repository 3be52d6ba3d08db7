//! # Graph Replication
//!
//! A bilateral replication engine for a pair of graph database instances.
//!
//! ## Architecture
//!
//! Each instance runs one engine. Local commits are captured in the
//! commit path, encoded into idempotent merge/delete operations keyed by
//! stable identifiers, and pushed to the peer over a length-prefixed
//! JSON protocol. The peer applies them in remote-origin transactions,
//! which the capture listener recognizes and suppresses, so changes
//! never echo back:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        graph-replication                         │
//! │                                                                  │
//! │  ┌───────────────────────┐   ┌─────────────┐   ┌─────────────┐   │
//! │  │ ChangeCaptureListener │──►│ bounded     │──►│ Dispatcher  │──►│──► peer
//! │  │ (commit path, drops   │   │ mpsc queue  │   │ (retry +    │   │
//! │  │  remote-origin sets)  │   └─────────────┘   │  reconnect) │   │
//! │  └───────────────────────┘                     └─────────────┘   │
//! │              ▲                                                   │
//! │              │ TxOrigin::Remote commits                          │
//! │  ┌───────────────────────┐                                       │
//! │◄─│ RemoteApplier         │◄──────────────────────────────────────│◄── peer
//! │  │ (credential handshake,│                                       │
//! │  │  sequential merge)    │                                       │
//! │  └───────────────────────┘                                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Convergence Model
//!
//! Delivery is at-least-once and unacknowledged; apply is merge-based
//! and idempotent, so redelivery converges instead of duplicating.
//! Entities are matched across instances by their `uuid` property
//! ([`event::STABLE_ID_PROPERTY`]), never by internal database ids.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use graph_replication::{MemoryGraph, ReplicationConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicationConfig::for_testing("node-a", "127.0.0.1:7688");
//!     let graph = Arc::new(MemoryGraph::new());
//!
//!     let engine = ReplicationEngine::new(config, graph);
//!     engine.start().await.expect("failed to start");
//!
//!     // Local commits now replicate until stop()
//!     engine.stop().await.expect("failed to stop");
//! }
//! ```

pub mod applier;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod graph;
pub mod listener;
pub mod metrics;
pub mod operation;
pub mod peer;
pub mod resilience;
pub mod wire;

// Re-exports for convenience
pub use config::{Credentials, InboundConfig, PeerConfig, QueueConfig, ReplicationConfig};
pub use coordinator::types::{CounterSnapshot, EngineState, EngineStatus};
pub use coordinator::ReplicationEngine;
pub use error::{ReplicationError, Result};
pub use event::{ChangeEvent, ChangeSet, PropertyMap, PropertyValue, StableId, TxOrigin};
pub use graph::{CommitListener, GraphHost, GraphSnapshot, MemoryGraph, Transaction};
pub use operation::{OpKind, ReplicationOperation};
