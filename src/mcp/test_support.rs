use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, Implementation, JsonObject, Prompt,
    ReadResourceResult, Resource, Tool,
};
use serde_json::json;

use super::backend::{BackendConnection, BackendConnector, TargetSpec};
use crate::error::{HubError, Result};
use crate::types::{ChainOutput, ChainStep, NodeEndpoint, ToolChainSpec};

/// Connector whose backends are scripted by derived name.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    tools: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    connect_delay: Option<Duration>,
    events: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_backend(mut self, name: &str, tools: &[&str]) -> Self {
        self.tools.insert(
            name.to_string(),
            tools.iter().map(|tool| tool.to_string()).collect(),
        );
        self
    }

    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().expect("events mutex should lock").clone()
    }

    fn count(&self, prefix: &str, name: &str) -> usize {
        let needle = format!("{prefix}:{name}");
        self.events().iter().filter(|e| **e == needle).count()
    }

    pub(crate) fn connect_count(&self, name: &str) -> usize {
        self.count("connect", name)
    }

    pub(crate) fn close_count(&self, name: &str) -> usize {
        self.count("close", name)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex should lock").clone()
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(
        &self,
        target: &TargetSpec,
        _client_info: &Implementation,
    ) -> Result<Arc<dyn BackendConnection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.events
            .lock()
            .expect("events mutex should lock")
            .push(format!("connect:{}", target.name));
        if self.failing.contains(&target.name) {
            return Err(HubError::backend(&target.name, "scripted connect failure"));
        }
        let tools = self
            .tools
            .get(&target.name)
            .cloned()
            .unwrap_or_else(|| vec![format!("{}_tool", target.name)]);
        Ok(Arc::new(ScriptedBackend {
            name: target.name.clone(),
            tools,
            events: Arc::clone(&self.events),
            calls: Arc::clone(&self.calls),
            closed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedBackend {
    name: String,
    tools: Vec<String>,
    events: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendConnection for ScriptedBackend {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.iter().map(|name| tool(name)).collect())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        let resource = serde_json::from_value(json!({
            "uri": format!("mem://{}/readme", self.name),
            "name": "readme"
        }))?;
        Ok(vec![resource])
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let prompt = serde_json::from_value(json!({
            "name": "summarize",
            "description": "Summarize a document"
        }))?;
        Ok(vec![prompt])
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Stream(format!("{} closed", self.name)));
        }
        self.calls
            .lock()
            .expect("calls mutex should lock")
            .push(format!("{}:{name}", self.name));
        let args = serde_json::Value::Object(arguments.unwrap_or_default());
        let mut result =
            CallToolResult::success(vec![Content::text(format!("{}:{name} ok", self.name))]);
        result.structured_content = Some(json!({
            "backend": self.name,
            "tool": name,
            "args": args
        }));
        Ok(result)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        Ok(serde_json::from_value(json!({
            "contents": [{ "uri": uri, "text": format!("contents of {uri}") }]
        }))?)
    }

    async fn get_prompt(&self, name: &str, _arguments: Option<JsonObject>) -> Result<GetPromptResult> {
        Ok(serde_json::from_value(json!({
            "description": format!("{name} from {}", self.name),
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": "summarize this" }
            }]
        }))?)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events
                .lock()
                .expect("events mutex should lock")
                .push(format!("close:{}", self.name));
        }
    }
}

pub(crate) fn tool(name: &str) -> Tool {
    let schema = json!({ "type": "object", "properties": {} });
    Tool::new(
        name.to_string(),
        format!("{name} tool"),
        schema.as_object().cloned().unwrap_or_default(),
    )
}

pub(crate) fn stdio_target(name: &str) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        endpoint: NodeEndpoint::Stdio {
            command: format!("/opt/mcp/{name}"),
            args: Vec::new(),
            env: Default::default(),
        },
    }
}

pub(crate) fn chain(name: &str, tools: &[&str]) -> ToolChainSpec {
    ToolChainSpec {
        name: name.to_string(),
        description: None,
        steps: tools
            .iter()
            .map(|tool| ChainStep {
                tool: tool.to_string(),
                args: serde_json::Map::new(),
            })
            .collect(),
        output: ChainOutput::Last,
    }
}
