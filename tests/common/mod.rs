//! Shared test helpers and mock backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mcp_hub::error::{HubError, Result};
use mcp_hub::mcp::{BackendConnection, BackendConnector, TargetSpec};
use mcp_hub::types::NodeSpec;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, Implementation, JsonObject, Prompt,
    ReadResourceResult, Resource, Tool,
};
use serde_json::json;

/// Connector serving canned tools per derived backend name.
/// Names without canned tools fail to connect.
#[derive(Default)]
pub struct MockConnector {
    tools: HashMap<String, Vec<String>>,
    connects: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, name: &str, tools: &[&str]) -> Self {
        self.tools.insert(
            name.to_string(),
            tools.iter().map(|tool| tool.to_string()).collect(),
        );
        self
    }

    pub fn connect_count(&self, name: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|connected| *connected == name)
            .count()
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(
        &self,
        target: &TargetSpec,
        _client_info: &Implementation,
    ) -> Result<Arc<dyn BackendConnection>> {
        self.connects.lock().unwrap().push(target.name.clone());
        let tools = self
            .tools
            .get(&target.name)
            .cloned()
            .ok_or_else(|| HubError::backend(&target.name, "connection refused"))?;
        Ok(Arc::new(MockBackend {
            name: target.name.clone(),
            tools,
        }))
    }
}

struct MockBackend {
    name: String,
    tools: Vec<String>,
}

#[async_trait]
impl BackendConnection for MockBackend {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.iter().map(|name| tool(name)).collect())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let args = serde_json::Value::Object(arguments.unwrap_or_default());
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{}:{name} {args}",
            self.name
        ))]))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        Err(HubError::not_found("resource", uri))
    }

    async fn get_prompt(&self, name: &str, _arguments: Option<JsonObject>) -> Result<GetPromptResult> {
        Err(HubError::not_found("prompt", name))
    }

    async fn close(&self) {}
}

pub fn tool(name: &str) -> Tool {
    let schema = json!({ "type": "object", "properties": {} });
    Tool::new(
        name.to_string(),
        format!("{name} tool"),
        schema.as_object().cloned().unwrap_or_default(),
    )
}

pub fn node(name: &str) -> NodeSpec {
    NodeSpec::stdio(name, format!("/opt/mcp/{name}"), vec![]).with_name(name)
}

pub fn initialize_request(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.1" }
        }
    })
    .to_string()
}
