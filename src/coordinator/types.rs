// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle state and status reporting types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine lifecycle state.
///
/// ```text
///          start()                       stop()
/// Idle ──► Connecting ──► Running ──► Stopping ──► Stopped
///   ▲          │
///   │          ├──► Idle   (peer unreachable, start() retryable)
///   └──────────┘
///              └──► Failed (unrecoverable, e.g. bind error)
/// ```
///
/// The engine runs one successful start/stop cycle; a stopped engine is
/// not restarted, a fresh one is constructed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Constructed, never started.
    Idle,
    /// `start()` in progress: binding the inbound listener and dialing
    /// the peer.
    Connecting,
    /// Capture, dispatch and apply are all live.
    Running,
    /// `stop()` in progress: draining the outbound queue.
    Stopping,
    /// Cleanly stopped. Terminal.
    Stopped,
    /// `start()` hit an unrecoverable error (e.g. inbound bind failed).
    /// Terminal for this instance.
    Failed,
}

impl EngineState {
    /// Numeric encoding for the state gauge.
    pub fn as_metric(&self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Connecting => 1,
            EngineState::Running => 2,
            EngineState::Stopping => 3,
            EngineState::Stopped => 4,
            EngineState::Failed => 5,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Connecting => "connecting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared counters updated by the capture listener, dispatcher and
/// applier. Read by [`crate::ReplicationEngine::status()`].
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Operations accepted into the outbound queue.
    pub enqueued: AtomicU64,
    /// Operations delivered to the peer.
    pub dispatched: AtomicU64,
    /// Whole change sets dropped because their transaction was
    /// remote-origin.
    pub suppressed_change_sets: AtomicU64,
    /// Events dropped because the outbound queue was full.
    pub backpressure_drops: AtomicU64,
    /// Events dropped at encode time for lack of a stable identifier.
    pub missing_identifiers: AtomicU64,
    /// Operations whose per-send retry budget was exhausted (each
    /// triggers a reconnect, the operation itself is retained).
    pub delivery_failures: AtomicU64,
    /// Remote operations applied to the local graph.
    pub applied: AtomicU64,
    /// Remote deletes that matched nothing locally.
    pub noop_applies: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            suppressed_change_sets: self.suppressed_change_sets.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            missing_identifiers: self.missing_identifiers.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            noop_applies: self.noop_applies.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub dispatched: u64,
    pub suppressed_change_sets: u64,
    pub backpressure_drops: u64,
    pub missing_identifiers: u64,
    pub delivery_failures: u64,
    pub applied: u64,
    pub noop_applies: u64,
}

/// Status snapshot returned by [`crate::ReplicationEngine::status()`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub local_node_id: String,
    pub peer_node_id: String,
    pub counters: CounterSnapshot,
}
