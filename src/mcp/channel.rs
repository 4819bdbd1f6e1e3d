//! In-process server transport fed by framed text deliveries.
//!
//! SSE sessions and outbound sockets both terminate in a [`ChannelTransport`]: the
//! rmcp service owns the transport half while the network side holds the
//! [`TransportPeer`], pushing raw deliveries through [`FrameInlet::deliver`] and
//! draining newline-terminated frames from the outlet.

use std::sync::Arc;

use rmcp::model::ClientJsonRpcMessage;
use rmcp::service::{RoleServer, RxJsonRpcMessage, TxJsonRpcMessage};
use rmcp::transport::Transport;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::framing::{decode_lines, encode_frame, FrameError};
use crate::error::{HubError, Result};

/// Outcome of one inbound delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub accepted: usize,
    pub errors: Vec<FrameError>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Server-side transport half handed to the rmcp service.
pub struct ChannelTransport {
    inbound: UnboundedReceiver<ClientJsonRpcMessage>,
    outbound: UnboundedSender<String>,
    closed: CancellationToken,
}

/// Network-side half: where inbound data enters and outbound frames leave.
pub struct TransportPeer {
    pub inlet: FrameInlet,
    pub outlet: UnboundedReceiver<String>,
    pub closed: CancellationToken,
}

/// Cloneable entry point for inbound deliveries.
#[derive(Clone)]
pub struct FrameInlet {
    tx: UnboundedSender<ClientJsonRpcMessage>,
    closed: CancellationToken,
    label: Arc<str>,
}

/// Create a connected transport pair. `label` tags log lines (session id or address).
pub fn channel_transport(label: impl Into<Arc<str>>) -> (ChannelTransport, TransportPeer) {
    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (outbound_tx, outbound_rx) = unbounded_channel();
    let closed = CancellationToken::new();

    let transport = ChannelTransport {
        inbound: inbound_rx,
        outbound: outbound_tx,
        closed: closed.clone(),
    };
    let peer = TransportPeer {
        inlet: FrameInlet {
            tx: inbound_tx,
            closed: closed.clone(),
            label: label.into(),
        },
        outlet: outbound_rx,
        closed,
    };
    (transport, peer)
}

impl FrameInlet {
    /// Parse each line of `data` and queue the valid messages in order.
    ///
    /// Messages queue until the service starts receiving, so nothing is lost
    /// between transport creation and handler attachment.
    pub fn deliver(&self, data: &str) -> Result<DeliveryReport> {
        if self.closed.is_cancelled() {
            return Err(HubError::Stream(format!("transport {} is closed", self.label)));
        }

        let mut report = DeliveryReport::default();
        for decoded in decode_lines::<ClientJsonRpcMessage>(data) {
            match decoded {
                Ok(message) => {
                    self.tx.send(message).map_err(|_| {
                        HubError::Stream(format!("transport {} is closed", self.label))
                    })?;
                    report.accepted += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        transport = %self.label,
                        line = error.line,
                        error = %error.message,
                        "dropping unparsable inbound line"
                    );
                    report.errors.push(error);
                }
            }
        }
        Ok(report)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Transport<RoleServer> for ChannelTransport {
    type Error = HubError;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send + 'static
    {
        let outbound = self.outbound.clone();
        let closed = self.closed.clone();
        let frame = encode_frame(&item);
        async move {
            if closed.is_cancelled() {
                return Err(HubError::Stream("transport closed".into()));
            }
            outbound
                .send(frame?)
                .map_err(|_| HubError::Stream("transport outlet dropped".into()))
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleServer>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            message = self.inbound.recv() => message,
        }
    }

    fn close(
        &mut self,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        self.closed.cancel();
        self.inbound.close();
        std::future::ready(Ok(()))
    }
}
