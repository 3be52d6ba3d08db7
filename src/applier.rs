// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound side: accept the peer's pushes and apply them locally.
//!
//! [`RemoteApplier`] owns the inbound TCP listener. Each connection is
//! handshake-checked against the configured credentials, then its
//! operation frames are applied strictly sequentially in arrival order.
//! Connections are handled one at a time, so applies from a reconnecting
//! peer can never interleave.
//!
//! Every apply runs in a [`TxOrigin::Remote`] transaction. That marker
//! is what keeps the capture listener from echoing the change back.
//!
//! Apply is merge-based and idempotent: a delete whose target is already
//! gone is a counted no-op, not an error, so redelivered operations
//! converge instead of failing.

use crate::config::Credentials;
use crate::coordinator::types::EngineCounters;
use crate::error::Result;
use crate::event::{PropertyValue, TxOrigin, STABLE_ID_PROPERTY};
use crate::graph::{GraphHost, Transaction};
use crate::metrics;
use crate::operation::{OpKind, ReplicationOperation};
use crate::wire::{read_frame, write_frame, Frame};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteApplier<H: GraphHost> {
    listener: TcpListener,
    local_node_id: String,
    credentials: Credentials,
    host: Arc<H>,
    counters: Arc<EngineCounters>,
    shutdown: watch::Receiver<bool>,
}

impl<H: GraphHost> RemoteApplier<H> {
    pub fn new(
        listener: TcpListener,
        local_node_id: String,
        credentials: Credentials,
        host: Arc<H>,
        counters: Arc<EngineCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            local_node_id,
            credentials,
            host,
            counters,
            shutdown,
        }
    }

    /// Accept loop. Connections are served inline, one at a time.
    pub async fn run(mut self) {
        debug!(node_id = %self.local_node_id, "inbound applier started");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    info!("inbound applier shutdown requested");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound connection accepted");
                    if let Err(e) = self.serve(stream).await {
                        debug!(%addr, error = %e, "inbound connection ended");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "inbound accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve(&mut self, mut stream: TcpStream) -> Result<()> {
        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await;
        let (node_id, username, password) = match hello {
            Ok(Ok(Frame::Hello {
                node_id,
                username,
                password,
            })) => (node_id, username, password),
            _ => {
                metrics::record_handshake_rejected();
                warn!("inbound connection did not open with Hello");
                return Ok(());
            }
        };

        if username != self.credentials.username || password != self.credentials.password {
            metrics::record_handshake_rejected();
            warn!(peer = %node_id, "inbound connection rejected: bad credentials");
            // Closing without Welcome is the rejection
            return Ok(());
        }

        write_frame(
            &mut stream,
            &Frame::Welcome {
                node_id: self.local_node_id.clone(),
            },
        )
        .await?;
        info!(peer = %node_id, "inbound peer authenticated");

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                frame = read_frame(&mut stream) => frame,
            };
            match frame {
                Ok(Frame::Operation(op)) => self.apply(op),
                Ok(other) => {
                    warn!(frame = ?other, "unexpected frame after handshake, closing");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one remote operation in a remote-origin transaction.
    fn apply(&self, op: ReplicationOperation) {
        let op_name = op.op.name();
        let mut tx = Transaction::new();
        match op.op {
            OpKind::MergeNode {
                id,
                labels,
                mut properties,
            } => {
                // The merge key must be present in the snapshot
                properties
                    .entry(STABLE_ID_PROPERTY.to_string())
                    .or_insert_with(|| PropertyValue::String(id.0.clone()));
                tx.merge_node(labels, properties);
            }
            OpKind::DeleteNode { id } => {
                tx.delete_node(id, true);
            }
            OpKind::MergeRelationship {
                start,
                end,
                rel_type,
                properties,
            } => {
                tx.merge_relationship(start, end, rel_type, properties);
            }
            OpKind::DeleteRelationship {
                start,
                end,
                rel_type,
            } => {
                tx.delete_relationship(start, end, rel_type);
            }
        }

        match self.host.execute(TxOrigin::Remote, tx) {
            Ok(change_set) if change_set.is_empty() => {
                // Delete target already gone: idempotent no-op
                self.counters.noop_applies.fetch_add(1, Ordering::Relaxed);
                metrics::record_noop_apply(&op.source);
                debug!(
                    source = %op.source,
                    sequence = op.sequence,
                    op = op_name,
                    "remote operation matched nothing, no-op"
                );
            }
            Ok(_) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                metrics::record_operation_applied(&op.source, op_name);
            }
            Err(e) => {
                warn!(
                    source = %op.source,
                    sequence = op.sequence,
                    op = op_name,
                    error = %e,
                    "failed to apply remote operation"
                );
            }
        }
    }
}
