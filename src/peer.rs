// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound peer connection management.
//!
//! [`PeerConnection`] owns the TCP stream to the remote peer's inbound
//! listener. Connecting is a dial plus one `Hello`/`Welcome` handshake,
//! both under the configured attempt timeout. Send failures poison the
//! stream; the dispatcher reconnects before retrying.

use crate::config::PeerConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::operation::ReplicationOperation;
use crate::resilience::RetryConfig;
use crate::wire::{read_frame, write_frame, Frame};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct PeerConnection {
    local_node_id: String,
    peer: PeerConfig,
    stream: Option<TcpStream>,
}

impl PeerConnection {
    pub fn new(local_node_id: String, peer: PeerConfig) -> Self {
        Self {
            local_node_id,
            peer,
            stream: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// One dial + handshake attempt, bounded by the peer's connect
    /// timeout.
    pub async fn connect(&mut self) -> Result<()> {
        let timeout = self.peer.connect_timeout_duration();
        let attempt = async {
            let stream = TcpStream::connect(&self.peer.address).await.map_err(|e| {
                ReplicationError::ConnectionFailed {
                    peer_id: self.peer.node_id.clone(),
                    message: e.to_string(),
                }
            })?;
            stream
                .set_nodelay(true)
                .map_err(|e| ReplicationError::io("set nodelay", e))?;
            self.handshake(stream).await
        };

        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::ConnectionFailed {
                peer_id: self.peer.node_id.clone(),
                message: format!("connect timed out after {:?}", timeout),
            }),
        };

        metrics::record_peer_connection(&self.peer.node_id, result.is_ok());
        match result {
            Ok(stream) => {
                info!(peer_id = %self.peer.node_id, address = %self.peer.address, "peer connected");
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                debug!(peer_id = %self.peer.node_id, error = %e, "peer connection attempt failed");
                Err(e)
            }
        }
    }

    async fn handshake(&self, mut stream: TcpStream) -> Result<TcpStream> {
        write_frame(
            &mut stream,
            &Frame::Hello {
                node_id: self.local_node_id.clone(),
                username: self.peer.credentials.username.clone(),
                password: self.peer.credentials.password.clone(),
            },
        )
        .await?;

        match read_frame(&mut stream).await {
            Ok(Frame::Welcome { node_id }) => {
                if node_id != self.peer.node_id {
                    // Config mismatch, not fatal: the peer accepted us.
                    warn!(
                        expected = %self.peer.node_id,
                        actual = %node_id,
                        "peer identified with unexpected node id"
                    );
                }
                Ok(stream)
            }
            Ok(other) => Err(ReplicationError::Handshake(format!(
                "expected Welcome, got {:?}",
                other
            ))),
            // Rejection shows up as the peer closing the socket
            Err(ReplicationError::Io { .. }) => Err(ReplicationError::Handshake(
                "peer closed connection during handshake".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Connect with exponential backoff until success, retry exhaustion
    /// or shutdown.
    pub async fn connect_with_retry(
        &mut self,
        retry: &RetryConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            if *shutdown.borrow() {
                return Err(ReplicationError::Shutdown);
            }
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= retry.max_attempts => {
                    warn!(
                        peer_id = %self.peer.node_id,
                        attempts = attempt,
                        error = %e,
                        "peer connection retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(
                        peer_id = %self.peer.node_id,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "retrying peer connection"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return Err(ReplicationError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Send one operation frame. A failed send drops the stream so the
    /// next attempt goes through a reconnect.
    pub async fn send(&mut self, op: &ReplicationOperation) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            ReplicationError::io(
                "send",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "peer not connected"),
            )
        })?;

        match write_frame(stream, &Frame::Operation(op.clone())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Drop the connection, flushing the socket best-effort.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stream.shutdown().await;
            debug!(peer_id = %self.peer.node_id, "peer connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::event::{ChangeEvent, NodeChange, PropertyMap, PropertyValue, StableId};
    use crate::operation::encode_event;
    use tokio::net::TcpListener;

    async fn spawn_server(accept_credentials: Option<Credentials>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let accept = accept_credentials.clone();
                tokio::spawn(async move {
                    match read_frame(&mut stream).await {
                        Ok(Frame::Hello {
                            username, password, ..
                        }) => {
                            let ok = accept
                                .map(|c| c.username == username && c.password == password)
                                .unwrap_or(false);
                            if ok {
                                write_frame(
                                    &mut stream,
                                    &Frame::Welcome {
                                        node_id: "test-peer".to_string(),
                                    },
                                )
                                .await
                                .unwrap();
                                // Keep draining so sends succeed
                                while read_frame(&mut stream).await.is_ok() {}
                            }
                            // Rejected: drop the stream
                        }
                        _ => {}
                    }
                });
            }
        });
        addr
    }

    fn sample_op() -> ReplicationOperation {
        let mut properties = PropertyMap::new();
        properties.insert("uuid".to_string(), PropertyValue::from("x"));
        encode_event(
            "node-a",
            1,
            &ChangeEvent::NodeCreated(NodeChange {
                id: Some(StableId::from("x")),
                labels: vec![],
                properties,
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let addr = spawn_server(Some(Credentials::for_testing())).await;
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", &addr.to_string()),
        );

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        conn.send(&sample_op()).await.unwrap();
        conn.close().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connect_rejected_credentials() {
        let addr = spawn_server(Some(Credentials {
            username: "other".to_string(),
            password: "other".to_string(),
        }))
        .await;
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", &addr.to_string()),
        );

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Handshake(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connect_unreachable_peer() {
        // Reserved port, nothing listening
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", "127.0.0.1:1"),
        );
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ReplicationError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", "127.0.0.1:1"),
        );
        let (_tx, mut shutdown) = watch::channel(false);
        let err = conn
            .connect_with_retry(&RetryConfig::testing(), &mut shutdown)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_with_retry_observes_shutdown() {
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", "127.0.0.1:1"),
        );
        let (tx, mut shutdown) = watch::channel(true);
        let _ = tx;
        let err = conn
            .connect_with_retry(&RetryConfig::testing(), &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Shutdown));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_retryable_io() {
        let mut conn = PeerConnection::new(
            "node-a".to_string(),
            PeerConfig::for_testing("test-peer", "127.0.0.1:1"),
        );
        let err = conn.send(&sample_op()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Io { .. }));
        assert!(err.is_retryable());
    }
}
