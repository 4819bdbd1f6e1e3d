//! Uniform view over one live backend server.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{
    CallToolResult, GetPromptResult, Implementation, JsonObject, Prompt, ReadResourceResult,
    Resource, Tool,
};

use super::client::McpClient;
use super::transport::transport_for;
use crate::error::Result;
use crate::naming::derive_node_name;
use crate::types::{NodeEndpoint, NodeSpec};

/// A backend as the composer sees it: a derived name plus its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub endpoint: NodeEndpoint,
}

impl TargetSpec {
    pub fn from_node(node: &NodeSpec) -> Self {
        Self {
            name: derive_node_name(node),
            endpoint: node.endpoint.clone(),
        }
    }
}

/// Operations the composer needs from one backend connection.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn list_resources(&self) -> Result<Vec<Resource>>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>>;
    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult>;
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult>;
    async fn get_prompt(&self, name: &str, arguments: Option<JsonObject>) -> Result<GetPromptResult>;
    /// Tear down the link. Idempotent.
    async fn close(&self);
}

/// Opens backend connections. Swapped for scripted connectors in tests.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        target: &TargetSpec,
        client_info: &Implementation,
    ) -> Result<Arc<dyn BackendConnection>>;
}

/// Connector that speaks MCP through rmcp: child processes for stdio nodes,
/// streamable HTTP for stream nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmcpConnector;

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(
        &self,
        target: &TargetSpec,
        client_info: &Implementation,
    ) -> Result<Arc<dyn BackendConnection>> {
        let transport = transport_for(&target.endpoint);
        tracing::debug!(backend = %target.name, endpoint = %transport.describe(), "connecting backend");
        let client = McpClient::connect(target.name.clone(), transport, client_info.clone()).await?;
        Ok(Arc::new(client))
    }
}

/// Capabilities discovered from a freshly connected backend.
#[derive(Debug, Default, Clone)]
pub struct BackendCatalog {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// List everything a backend offers. Tool listing is mandatory, the rest best-effort.
pub async fn discover(name: &str, connection: &dyn BackendConnection) -> Result<BackendCatalog> {
    let tools = connection.list_tools().await?;
    let resources = connection.list_resources().await.unwrap_or_else(|error| {
        tracing::warn!(backend = name, %error, "resource discovery failed");
        Vec::new()
    });
    let prompts = connection.list_prompts().await.unwrap_or_else(|error| {
        tracing::warn!(backend = name, %error, "prompt discovery failed");
        Vec::new()
    });
    Ok(BackendCatalog {
        tools,
        resources,
        prompts,
    })
}
