//! MCP plumbing: backend clients, the composer that merges them, and the
//! virtual server that exposes the merged catalog.

pub mod backend;
pub mod chain;
pub mod channel;
pub mod client;
pub mod composer;
pub mod framing;
pub mod registry;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BackendConnection, BackendConnector, RmcpConnector, TargetSpec};
pub use channel::{channel_transport, DeliveryReport, FrameInlet, TransportPeer};
pub use client::McpClient;
pub use composer::{Composer, TargetClientStatus, TargetStatus, ToolDescriptor};
pub use server::VirtualServer;
