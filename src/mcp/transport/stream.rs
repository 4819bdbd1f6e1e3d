use async_trait::async_trait;
use rmcp::model::ClientInfo;
use rmcp::service::{ClientInitializeError, ServiceExt};
use rmcp::transport::StreamableHttpClientTransport;

use super::{McpRunningService, McpTransport};

/// Streamable HTTP transport (for remote MCP servers).
pub struct StreamTransport {
    url: String,
}

impl StreamTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl McpTransport for StreamTransport {
    async fn connect(
        &mut self,
        client_info: ClientInfo,
    ) -> Result<McpRunningService, ClientInitializeError> {
        let transport = StreamableHttpClientTransport::from_uri(self.url.clone());
        client_info.into_dyn().serve(transport).await
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
