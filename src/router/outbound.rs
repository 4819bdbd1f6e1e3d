//! Outbound registration over a websocket, kept alive by a supervised task.
//!
//! Each attempt builds a fresh server from the router's current configuration,
//! so a rebuild after reconfiguration and a reconnect after failure follow the
//! same path. Retries run at a fixed delay with no attempt limit until the
//! client's cancellation token fires.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::mcp::{channel_transport, FrameInlet, TransportPeer, VirtualServer};

/// Delay between a failed or closed attempt and the next one.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a configured, not yet connected server for one outbound attempt.
#[async_trait]
pub trait ServerFactory: Send + Sync {
    async fn build_server(&self, label: String) -> Arc<VirtualServer>;
}

/// Public view of a live outbound registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConnection {
    pub address: String,
    pub attempt: u64,
    pub connected_at: DateTime<Utc>,
}

struct ActiveEntry {
    view: OutboundConnection,
    server: Arc<VirtualServer>,
}

/// Live outbound registrations of one router.
#[derive(Default)]
pub struct ActiveOutbound {
    entries: Mutex<Vec<ActiveEntry>>,
}

impl ActiveOutbound {
    fn lock(&self) -> MutexGuard<'_, Vec<ActiveEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, view: OutboundConnection, server: Arc<VirtualServer>) {
        let mut entries = self.lock();
        entries.retain(|entry| entry.view.address != view.address);
        entries.push(ActiveEntry { view, server });
    }

    fn remove(&self, address: &str, attempt: u64) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !(entry.view.address == address && entry.view.attempt == attempt));
        entries.len() != before
    }

    pub fn list(&self) -> Vec<OutboundConnection> {
        self.lock().iter().map(|entry| entry.view.clone()).collect()
    }

    pub fn servers(&self) -> Vec<Arc<VirtualServer>> {
        self.lock().iter().map(|entry| Arc::clone(&entry.server)).collect()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// Handle to one supervised outbound task.
pub struct OutboundClient {
    address: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OutboundClient {
    pub fn spawn(
        address: String,
        factory: Arc<dyn ServerFactory>,
        active: Arc<ActiveOutbound>,
        reconnect_delay: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            address: address.clone(),
            factory,
            active,
            reconnect_delay,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());
        Self {
            address,
            cancel,
            task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Cancel the supervisor and wait for its teardown.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await.is_err() {
            tracing::warn!(address = %self.address, "outbound client did not stop in time");
        }
    }
}

struct Supervisor {
    address: String,
    factory: Arc<dyn ServerFactory>,
    active: Arc<ActiveOutbound>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut attempt = 0u64;
        while !self.cancel.is_cancelled() {
            attempt += 1;
            match self.attempt(attempt).await {
                Ok(()) if self.cancel.is_cancelled() => break,
                Ok(()) => tracing::info!(
                    address = %self.address,
                    attempt,
                    "outbound connection closed, reconnecting"
                ),
                Err(error) => tracing::warn!(
                    address = %self.address,
                    attempt,
                    %error,
                    delay_ms = self.reconnect_delay.as_millis() as u64,
                    "outbound connection failed, retrying"
                ),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        tracing::debug!(address = %self.address, "outbound client stopped");
    }

    /// One connect-serve cycle. `Ok` means the connection ended normally.
    async fn attempt(&self, attempt: u64) -> Result<()> {
        let socket = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(self.address.as_str()) => {
                let (socket, _response) = connected.map_err(|error| {
                    HubError::Stream(format!("connect {}: {error}", self.address))
                })?;
                socket
            }
        };

        let server = self
            .factory
            .build_server(format!("outbound:{}", self.address))
            .await;
        let (transport, peer) = channel_transport(self.address.as_str());
        if let Err(error) = server.connect(transport) {
            server.close().await;
            return Err(error);
        }

        self.active.record(
            OutboundConnection {
                address: self.address.clone(),
                attempt,
                connected_at: Utc::now(),
            },
            Arc::clone(&server),
        );
        tracing::info!(address = %self.address, attempt, "outbound registration connected");

        let TransportPeer {
            inlet,
            mut outlet,
            closed,
        } = peer;
        let (mut sink, mut stream) = socket.split();

        let reader = async {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(address = %self.address, "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(error) => {
                        tracing::warn!(address = %self.address, %error, "outbound socket read failed");
                        break;
                    }
                };
                if !deliver(&inlet, &self.address, &text) {
                    break;
                }
            }
        };
        let writer = async {
            while let Some(frame) = outlet.recv().await {
                if let Err(error) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(address = %self.address, %error, "outbound socket write failed");
                    break;
                }
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = reader => {}
            _ = writer => {}
            _ = server.stopped() => {}
        }

        self.active.remove(&self.address, attempt);
        closed.cancel();
        let _ = sink.close().await;
        server.close().await;
        Ok(())
    }
}

/// Parse errors are reported per line and keep the connection open.
fn deliver(inlet: &FrameInlet, address: &str, text: &str) -> bool {
    match inlet.deliver(text) {
        Ok(report) => {
            for error in &report.errors {
                tracing::warn!(address, line = error.line, error = %error.message, "unparsable outbound frame");
            }
            true
        }
        Err(_) => false,
    }
}
