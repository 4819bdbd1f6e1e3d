//! Client-side transports used to reach backend servers.

use async_trait::async_trait;
use rmcp::model::ClientInfo;
use rmcp::service::{ClientInitializeError, DynService, RoleClient, RunningService};

use crate::types::NodeEndpoint;

pub type DynClientService = Box<dyn DynService<RoleClient>>;
pub type McpRunningService = RunningService<RoleClient, DynClientService>;

/// Something that can produce an initialized rmcp client session.
#[async_trait]
pub trait McpTransport: Send {
    /// Create and initialize a new rmcp running service for this transport.
    async fn connect(
        &mut self,
        client_info: ClientInfo,
    ) -> Result<McpRunningService, ClientInitializeError>;

    /// Short human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

mod stdio;
mod stream;

pub use stdio::StdioTransport;
pub use stream::StreamTransport;

/// Pick the transport matching a node endpoint.
pub fn transport_for(endpoint: &NodeEndpoint) -> Box<dyn McpTransport> {
    match endpoint {
        NodeEndpoint::Stream { url } => Box::new(StreamTransport::new(url.clone())),
        NodeEndpoint::Stdio { command, args, env } => Box::new(
            StdioTransport::new(command.clone(), args.clone()).with_env(env.clone()),
        ),
    }
}
