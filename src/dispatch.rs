// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound dispatcher: drains the queue and pushes to the peer.
//!
//! A single worker task preserves commit order: operations leave in
//! exactly the order the capture listener enqueued them. Each operation
//! gets a bounded retry budget; when that is exhausted the dispatcher
//! counts a delivery failure, falls back to a full reconnect loop, and
//! resends the same operation once the peer is back. An operation is
//! never skipped, reordered or dropped by the dispatcher.
//!
//! The worker exits when the queue is closed and drained (clean stop)
//! or when the shutdown signal fires (drain timeout elapsed).

use crate::coordinator::types::EngineCounters;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::operation::ReplicationOperation;
use crate::peer::PeerConnection;
use crate::resilience::RetryConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Dispatcher {
    queue: mpsc::Receiver<ReplicationOperation>,
    connection: PeerConnection,
    delivery_retry: RetryConfig,
    reconnect_retry: RetryConfig,
    counters: Arc<EngineCounters>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        queue: mpsc::Receiver<ReplicationOperation>,
        connection: PeerConnection,
        delivery_retry: RetryConfig,
        reconnect_retry: RetryConfig,
        counters: Arc<EngineCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            connection,
            delivery_retry,
            reconnect_retry,
            counters,
            shutdown,
        }
    }

    /// Worker loop. Runs until the queue closes or shutdown fires.
    pub async fn run(mut self) {
        debug!(peer_id = %self.connection.peer_id(), "dispatcher started");
        loop {
            let op = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    info!("dispatcher shutdown requested");
                    break;
                }
                op = self.queue.recv() => match op {
                    Some(op) => op,
                    None => {
                        debug!("outbound queue closed and drained");
                        break;
                    }
                },
            };

            if let Err(ReplicationError::Shutdown) = self.deliver(op).await {
                break;
            }
        }
        self.connection.close().await;
        debug!("dispatcher stopped");
    }

    /// Deliver one operation, retrying and reconnecting until it lands
    /// or shutdown fires. The operation is retained across reconnects.
    async fn deliver(&mut self, op: ReplicationOperation) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            if *self.shutdown.borrow() {
                return Err(ReplicationError::Shutdown);
            }
            attempt += 1;

            if !self.connection.is_connected() {
                // Quick single reattach; the full backoff loop runs only
                // after the retry budget is spent.
                let _ = self.connection.connect().await;
            }

            let send = tokio::time::timeout(
                self.delivery_retry.connection_timeout,
                self.connection.send(&op),
            );
            let result = match send.await {
                Ok(result) => result,
                Err(_) => Err(ReplicationError::io(
                    "send",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "send timed out"),
                )),
            };

            match result {
                Ok(()) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    metrics::record_operation_dispatched(self.connection.peer_id(), op.op.name());
                    metrics::record_dispatch_latency(self.connection.peer_id(), started.elapsed());
                    return Ok(());
                }
                Err(e) if attempt >= self.delivery_retry.max_attempts => {
                    self.counters
                        .delivery_failures
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_delivery_failure(self.connection.peer_id());
                    warn!(
                        sequence = op.sequence,
                        attempts = attempt,
                        error = %e,
                        "delivery retries exhausted, reconnecting"
                    );
                    match self
                        .connection
                        .connect_with_retry(&self.reconnect_retry, &mut self.shutdown)
                        .await
                    {
                        Ok(()) => {}
                        Err(ReplicationError::Shutdown) => return Err(ReplicationError::Shutdown),
                        Err(e) => {
                            // A spent reconnect policy does not forfeit
                            // the operation; start the cycle over
                            warn!(
                                sequence = op.sequence,
                                error = %e,
                                "reconnect attempts exhausted, holding operation"
                            );
                        }
                    }
                    // Fresh budget for the retained operation
                    attempt = 0;
                }
                Err(e) => {
                    let delay = self.delivery_retry.delay_for_attempt(attempt);
                    debug!(
                        sequence = op.sequence,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => return Err(ReplicationError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, PeerConfig};
    use crate::event::{ChangeEvent, NodeChange, PropertyMap, PropertyValue, StableId};
    use crate::operation::encode_event;
    use crate::wire::{read_frame, write_frame, Frame};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn serve_sink(listener: TcpListener) -> Arc<Mutex<Vec<ReplicationOperation>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let sink = sink.clone();
                tokio::spawn(async move {
                    let Ok(Frame::Hello { .. }) = read_frame(&mut stream).await else {
                        return;
                    };
                    write_frame(
                        &mut stream,
                        &Frame::Welcome {
                            node_id: "test-peer".to_string(),
                        },
                    )
                    .await
                    .unwrap();
                    while let Ok(frame) = read_frame(&mut stream).await {
                        if let Frame::Operation(op) = frame {
                            sink.lock().unwrap().push(op);
                        }
                    }
                });
            }
        });
        received
    }

    async fn spawn_sink() -> (std::net::SocketAddr, Arc<Mutex<Vec<ReplicationOperation>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (addr, serve_sink(listener))
    }

    fn op(seq: u64, id: &str) -> ReplicationOperation {
        let mut properties = PropertyMap::new();
        properties.insert("uuid".to_string(), PropertyValue::from(id));
        encode_event(
            "node-a",
            seq,
            &ChangeEvent::NodeCreated(NodeChange {
                id: Some(StableId::from(id)),
                labels: vec!["Test".to_string()],
                properties,
            }),
        )
        .unwrap()
    }

    fn dispatcher_for(
        addr: std::net::SocketAddr,
        queue: mpsc::Receiver<ReplicationOperation>,
        shutdown: watch::Receiver<bool>,
    ) -> (Dispatcher, Arc<EngineCounters>) {
        let counters = Arc::new(EngineCounters::default());
        let connection = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", &addr.to_string()),
        );
        let dispatcher = Dispatcher::new(
            queue,
            connection,
            RetryConfig::testing(),
            RetryConfig::testing(),
            counters.clone(),
            shutdown,
        );
        (dispatcher, counters)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_delivers_in_queue_order() {
        let (addr, received) = spawn_sink().await;
        let (tx, rx) = mpsc::channel(16);
        let (_stop, shutdown) = watch::channel(false);
        let (dispatcher, counters) = dispatcher_for(addr, rx, shutdown);

        let handle = tokio::spawn(dispatcher.run());
        for i in 1..=3 {
            tx.send(op(i, &format!("id-{}", i))).await.unwrap();
        }
        wait_for(|| received.lock().unwrap().len() == 3).await;

        let seqs: Vec<u64> = received.lock().unwrap().iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(counters.dispatched.load(Ordering::Relaxed), 3);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_queue_closed_after_drain() {
        let (addr, received) = spawn_sink().await;
        let (tx, rx) = mpsc::channel(16);
        let (_stop, shutdown) = watch::channel(false);
        let (dispatcher, _) = dispatcher_for(addr, rx, shutdown);

        tx.send(op(1, "a")).await.unwrap();
        drop(tx);
        dispatcher.run().await;

        // The queued op was drained before exit
        wait_for(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker() {
        let (addr, _) = spawn_sink().await;
        let (_tx, rx) = mpsc::channel::<ReplicationOperation>(16);
        let (stop, shutdown) = watch::channel(false);
        let (dispatcher, _) = dispatcher_for(addr, rx, shutdown);

        let handle = tokio::spawn(dispatcher.run());
        stop.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_holds_operation_through_reconnect_budget_exhaustion() {
        // No server behind the address at first, so the delivery budget
        // and the finite reconnect policy both run out repeatedly. The
        // operation must be held, not dropped, until the peer appears.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (tx, rx) = mpsc::channel(16);
        let (_stop, shutdown) = watch::channel(false);
        let (dispatcher, counters) = dispatcher_for(addr, rx, shutdown);
        let handle = tokio::spawn(dispatcher.run());
        tx.send(op(1, "late")).await.unwrap();

        // Two delivery failures means one full reconnect cycle was
        // exhausted and the worker went around again
        wait_for(|| counters.delivery_failures.load(Ordering::Relaxed) >= 2).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let received = serve_sink(listener);
        wait_for(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap()[0].sequence, 1);
        assert_eq!(counters.dispatched.load(Ordering::Relaxed), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retains_operation_across_peer_restart() {
        // Server that rejects the first connection mid-handshake, then
        // behaves normally. The dispatcher must retain the op and land
        // it on the second connection.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(Frame::Hello { .. }) = read_frame(&mut stream).await else {
                    continue;
                };
                if first {
                    first = false;
                    drop(stream);
                    continue;
                }
                write_frame(
                    &mut stream,
                    &Frame::Welcome {
                        node_id: "test-peer".to_string(),
                    },
                )
                .await
                .unwrap();
                let sink = sink.clone();
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame(&mut stream).await {
                        if let Frame::Operation(op) = frame {
                            sink.lock().unwrap().push(op);
                        }
                    }
                });
            }
        });

        let (tx, rx) = mpsc::channel(16);
        let (_stop, shutdown) = watch::channel(false);
        let (dispatcher, counters) = dispatcher_for(addr, rx, shutdown);
        let handle = tokio::spawn(dispatcher.run());

        tx.send(op(1, "survivor")).await.unwrap();
        wait_for(|| !received.lock().unwrap().is_empty()).await;

        assert_eq!(received.lock().unwrap()[0].sequence, 1);
        assert_eq!(counters.dispatched.load(Ordering::Relaxed), 1);

        drop(tx);
        handle.await.unwrap();
    }
}
