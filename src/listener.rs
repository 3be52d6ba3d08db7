//! Change capture: the commit listener feeding the outbound queue.
//!
//! [`ChangeCaptureListener`] sits in the host's commit path. For every
//! committed transaction it either suppresses the whole change set (the
//! transaction was remote-origin, so forwarding it would echo the
//! change back to the peer that sent it) or encodes each event into a
//! [`ReplicationOperation`](crate::operation::ReplicationOperation) and
//! enqueues it.
//!
//! The enqueue is `try_send` on a bounded channel: the commit path is
//! never blocked by replication. Overflow drops the event, counts it,
//! and surfaces on the engine status.

use crate::coordinator::types::EngineCounters;
use crate::error::ReplicationError;
use crate::event::{ChangeSet, TxOrigin};
use crate::graph::CommitListener;
use crate::metrics;
use crate::operation::{encode_event, ReplicationOperation};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ChangeCaptureListener {
    local_node_id: String,
    queue: mpsc::Sender<ReplicationOperation>,
    queue_capacity: usize,
    sequence: AtomicU64,
    counters: Arc<EngineCounters>,
}

impl ChangeCaptureListener {
    pub fn new(
        local_node_id: String,
        queue: mpsc::Sender<ReplicationOperation>,
        queue_capacity: usize,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            local_node_id,
            queue,
            queue_capacity,
            sequence: AtomicU64::new(1),
            counters,
        }
    }
}

impl CommitListener for ChangeCaptureListener {
    fn on_commit(&self, change_set: &ChangeSet) {
        if change_set.origin == TxOrigin::Remote {
            // The peer already has this change; forwarding it would loop.
            self.counters
                .suppressed_change_sets
                .fetch_add(1, Ordering::Relaxed);
            metrics::record_change_set_suppressed(change_set.events.len());
            debug!(
                events = change_set.events.len(),
                "suppressed remote-origin change set"
            );
            return;
        }

        metrics::record_events_captured(change_set.events.len());

        for event in &change_set.events {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let op = match encode_event(&self.local_node_id, sequence, event) {
                Ok(op) => op,
                Err(ReplicationError::MissingStableIdentifier { entity }) => {
                    // Not replicable without a stable id; drop just this
                    // event, the rest of the transaction still flows.
                    self.counters
                        .missing_identifiers
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_missing_identifier();
                    warn!(%entity, "skipping event without stable identifier");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to encode change event");
                    continue;
                }
            };

            let op_name = op.op.name();
            match self.queue.try_send(op) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    metrics::record_operation_enqueued(op_name);
                    metrics::set_queue_depth(self.queue_capacity - self.queue.capacity());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters
                        .backpressure_drops
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_backpressure_drop();
                    metrics::set_queue_depth(self.queue_capacity);
                    warn!(
                        capacity = self.queue_capacity,
                        sequence, "outbound queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Engine is stopping; commits after shutdown are not
                    // replicated.
                    debug!(sequence, "outbound queue closed, dropping event");
                }
            }
        }
    }
}
