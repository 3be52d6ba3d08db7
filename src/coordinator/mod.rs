// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle coordination.
//!
//! [`ReplicationEngine`] wires the pieces together and owns their
//! lifecycle: the capture listener in the host's commit path, the
//! bounded outbound queue, the dispatcher task pushing to the peer, and
//! the inbound applier task serving the peer's pushes.
//!
//! The engine runs one explicit start/stop cycle (see
//! [`EngineState`](types::EngineState)). `start()` is fail-fast: if the
//! peer is unreachable after a short retry budget it returns
//! `ConnectionFailed` and drops back to `Idle` for an explicit operator
//! retry. Once `Running`, peer outages are handled by the dispatcher's
//! reconnect loop instead.
//!
//! `stop()` detaches the capture listener first, then closes the queue
//! and gives the dispatcher a bounded drain window before tearing the
//! connection down.

pub mod types;

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::graph::{GraphHost, ListenerId};
use crate::listener::ChangeCaptureListener;
use crate::metrics;
use crate::operation::ReplicationOperation;
use crate::peer::PeerConnection;
use crate::applier::RemoteApplier;
use crate::dispatch::Dispatcher;
use crate::resilience::RetryConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::{EngineCounters, EngineState, EngineStatus};

/// How long task teardown waits after the shutdown signal before
/// aborting a task outright.
const TASK_ABORT_TIMEOUT: Duration = Duration::from_secs(1);

struct RunningTasks {
    queue_tx: mpsc::Sender<ReplicationOperation>,
    listener_id: ListenerId,
    dispatcher: JoinHandle<()>,
    applier: JoinHandle<()>,
    inbound_addr: SocketAddr,
}

pub struct ReplicationEngine<H: GraphHost> {
    config: ReplicationConfig,
    host: Arc<H>,
    counters: Arc<EngineCounters>,
    state_tx: watch::Sender<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    // Also serializes start()/stop() against each other
    tasks: Mutex<Option<RunningTasks>>,
}

impl<H: GraphHost> ReplicationEngine<H> {
    pub fn new(config: ReplicationConfig, host: Arc<H>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            host,
            counters: Arc::new(EngineCounters::default()),
            state_tx,
            shutdown_tx,
            tasks: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions (tests, health endpoints).
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Local address of the inbound listener, once running. With a
    /// `:0` bind this is where the ephemeral port shows up.
    pub async fn inbound_addr(&self) -> Option<SocketAddr> {
        self.tasks.lock().await.as_ref().map(|t| t.inbound_addr)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            local_node_id: self.config.local_node_id.clone(),
            peer_node_id: self.config.peer.node_id.clone(),
            counters: self.counters.snapshot(),
        }
    }

    fn set_state(&self, state: EngineState) {
        // send_replace: transitions must land even with no subscribers
        let _ = self.state_tx.send_replace(state);
        metrics::set_engine_state(state.as_metric());
        debug!(%state, "engine state changed");
    }

    /// Start replication: bind the inbound listener, connect to the
    /// peer, attach the capture listener and launch the workers.
    ///
    /// Fails with `InvalidState` unless the engine is `Idle`, and with
    /// `ConnectionFailed` if the peer cannot be reached (the engine
    /// returns to `Idle` so the call can be retried). Bind failures are
    /// unrecoverable and land in `Failed`.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        let current = self.state();
        if current != EngineState::Idle {
            return Err(ReplicationError::InvalidState {
                expected: EngineState::Idle.to_string(),
                actual: current.to_string(),
            });
        }
        self.set_state(EngineState::Connecting);

        info!(
            local = %self.config.local_node_id,
            peer = %self.config.peer.node_id,
            "starting replication engine"
        );

        let inbound = match TcpListener::bind(&self.config.inbound.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %self.config.inbound.listen_addr, error = %e, "inbound bind failed");
                self.set_state(EngineState::Failed);
                return Err(ReplicationError::io("bind inbound listener", e));
            }
        };
        let inbound_addr = inbound
            .local_addr()
            .map_err(|e| ReplicationError::io("inbound local addr", e))?;

        // Fail fast: a peer that is down at start time goes back to the
        // caller rather than into a silent retry loop.
        let mut connection = PeerConnection::new(
            self.config.local_node_id.clone(),
            self.config.peer.clone(),
        );
        let startup_retry = RetryConfig {
            connection_timeout: self.config.peer.connect_timeout_duration(),
            ..RetryConfig::startup()
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if let Err(e) = connection
            .connect_with_retry(&startup_retry, &mut shutdown_rx)
            .await
        {
            error!(peer = %self.config.peer.node_id, error = %e, "peer connection failed at start");
            // Back to Idle: an unreachable peer is worth an explicit
            // operator retry, unlike a bind failure
            self.set_state(EngineState::Idle);
            return Err(match e {
                e @ ReplicationError::ConnectionFailed { .. } => e,
                other => ReplicationError::ConnectionFailed {
                    peer_id: self.config.peer.node_id.clone(),
                    message: other.to_string(),
                },
            });
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue.capacity);

        let capture = Arc::new(ChangeCaptureListener::new(
            self.config.local_node_id.clone(),
            queue_tx.clone(),
            self.config.queue.capacity,
            self.counters.clone(),
        ));
        let listener_id = self.host.register_listener(capture);

        let applier = RemoteApplier::new(
            inbound,
            self.config.local_node_id.clone(),
            self.config.inbound.credentials.clone(),
            self.host.clone(),
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        );
        let applier_handle = tokio::spawn(applier.run());

        let delivery_retry = self.config.delivery.retry_config();
        // Reconnects never give up; the bounded queue is the backstop
        let reconnect_retry = RetryConfig {
            connection_timeout: self.config.peer.connect_timeout_duration(),
            ..RetryConfig::reconnect()
        };
        let dispatcher = Dispatcher::new(
            queue_rx,
            connection,
            delivery_retry,
            reconnect_retry,
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        *tasks = Some(RunningTasks {
            queue_tx,
            listener_id,
            dispatcher: dispatcher_handle,
            applier: applier_handle,
            inbound_addr,
        });

        self.set_state(EngineState::Running);
        info!(inbound = %inbound_addr, "replication engine running");
        Ok(())
    }

    /// Stop replication: detach the capture listener, drain the
    /// outbound queue within the configured window, then tear down the
    /// connection and the inbound applier.
    ///
    /// Returns `NotRunning` when the engine is not `Running`, mirroring
    /// an operator stopping an engine that was never started.
    pub async fn stop(&self) -> Result<()> {
        let mut tasks_guard = self.tasks.lock().await;

        if self.state() != EngineState::Running {
            return Err(ReplicationError::NotRunning);
        }
        let Some(tasks) = tasks_guard.take() else {
            return Err(ReplicationError::NotRunning);
        };
        self.set_state(EngineState::Stopping);
        info!("stopping replication engine");

        // New commits stop flowing into the queue
        self.host.unregister_listener(tasks.listener_id);

        // Closing the queue lets the dispatcher drain what is left
        drop(tasks.queue_tx);

        let drain = self.config.stop_drain_timeout_duration();
        match tokio::time::timeout(drain, tasks.dispatcher).await {
            Ok(Ok(())) => debug!("dispatcher drained and exited"),
            Ok(Err(e)) => warn!(error = %e, "dispatcher task panicked"),
            Err(_) => {
                warn!(timeout = ?drain, "dispatcher drain timed out, forcing shutdown");
            }
        }

        // Stop the applier (and a still-draining dispatcher)
        let _ = self.shutdown_tx.send_replace(true);
        match tokio::time::timeout(TASK_ABORT_TIMEOUT, tasks.applier).await {
            Ok(Ok(())) => debug!("inbound applier exited"),
            Ok(Err(e)) => warn!(error = %e, "inbound applier task panicked"),
            Err(_) => {
                warn!("inbound applier did not exit in time, detaching");
            }
        }

        self.set_state(EngineState::Stopped);
        info!("replication engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn engine_for(peer_addr: &str) -> ReplicationEngine<MemoryGraph> {
        let config = ReplicationConfig::for_testing("node-a", peer_addr);
        ReplicationEngine::new(config, Arc::new(MemoryGraph::new()))
    }

    #[tokio::test]
    async fn test_new_engine_is_idle() {
        let engine = engine_for("127.0.0.1:1");
        assert_eq!(engine.state(), EngineState::Idle);
        let status = engine.status();
        assert_eq!(status.local_node_id, "node-a");
        assert_eq!(status.counters.enqueued, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_not_running() {
        let engine = engine_for("127.0.0.1:1");
        let err = engine.stop().await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotRunning));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_start_with_unreachable_peer_returns_to_idle() {
        let engine = engine_for("127.0.0.1:1");
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::ConnectionFailed { .. }));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_start_retryable_after_connection_failure() {
        let engine = engine_for("127.0.0.1:1");
        let _ = engine.start().await;
        // Still Idle, so a second attempt runs the same path again
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::ConnectionFailed { .. }));
    }
}
