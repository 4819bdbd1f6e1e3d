//! rmcp-backed connection to one backend server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientInfo, GetPromptRequestParams, GetPromptResult,
    Implementation, JsonObject, Prompt, ProtocolVersion, ReadResourceRequestParams,
    ReadResourceResult, Resource, Tool,
};
use rmcp::service::{ClientInitializeError, Peer, RoleClient, ServiceError};
use tokio::sync::Mutex;

use super::backend::BackendConnection;
use super::transport::{McpRunningService, McpTransport};
use crate::error::{HubError, Result};

/// Client for one backend Model Context Protocol server.
///
/// Holds the transport so a dropped session can be re-established once per call.
pub struct McpClient {
    name: String,
    client_info: Implementation,
    transport: Mutex<Box<dyn McpTransport>>,
    session: Mutex<Option<McpRunningService>>,
    peer: RwLock<Option<Peer<RoleClient>>>,
    closed: AtomicBool,
}

impl McpClient {
    /// Connect and initialize, trying the latest protocol version first.
    pub async fn connect(
        name: impl Into<String>,
        mut transport: Box<dyn McpTransport>,
        client_info: Implementation,
    ) -> Result<Self> {
        let name = name.into();
        let session = connect_with_protocol_fallback(transport.as_mut(), &client_info)
            .await
            .map_err(|error| map_client_initialize_error(&name, error))?;

        if let Some(info) = session.peer_info() {
            tracing::debug!(
                backend = %name,
                server = %info.server_info.name,
                version = %info.server_info.version,
                "backend initialized"
            );
        }

        Ok(Self::from_running_service(name, transport, client_info, session))
    }

    /// Wrap an already-initialized rmcp session.
    pub fn from_running_service(
        name: impl Into<String>,
        transport: Box<dyn McpTransport>,
        client_info: Implementation,
        session: McpRunningService,
    ) -> Self {
        let peer = session.peer().clone();
        Self {
            name: name.into(),
            client_info,
            transport: Mutex::new(transport),
            session: Mutex::new(Some(session)),
            peer: RwLock::new(Some(peer)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current_peer(&self) -> Result<Peer<RoleClient>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Stream(format!("backend {} is closed", self.name)));
        }
        self.peer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| HubError::Stream(format!("backend {} has no session", self.name)))
    }

    async fn reconnect(&self) -> Result<Peer<RoleClient>> {
        let mut transport = self.transport.lock().await;
        let session = connect_with_protocol_fallback(transport.as_mut(), &self.client_info)
            .await
            .map_err(|error| map_client_initialize_error(&self.name, error))?;
        let peer = session.peer().clone();

        let previous = self.session.lock().await.replace(session);
        *self
            .peer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(peer.clone());
        if let Some(previous) = previous {
            let _ = previous.cancel().await;
        }

        tracing::info!(backend = %self.name, endpoint = %transport.describe(), "backend session re-established");
        Ok(peer)
    }

    /// Run `op` against the live peer, reconnecting once if the session dropped.
    async fn with_peer<T, F, Fut>(&self, context: &str, op: F) -> Result<T>
    where
        F: Fn(Peer<RoleClient>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ServiceError>>,
    {
        let peer = self.current_peer()?;
        match op(peer).await {
            Ok(value) => Ok(value),
            Err(error) if should_reconnect_after_service_error(&error) => {
                tracing::warn!(backend = %self.name, %error, "{context} failed on a dropped session, reconnecting");
                let peer = self.reconnect().await?;
                op(peer)
                    .await
                    .map_err(|retry_error| map_service_error(&self.name, context, retry_error))
            }
            Err(error) => Err(map_service_error(&self.name, context, error)),
        }
    }
}

#[async_trait]
impl BackendConnection for McpClient {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.with_peer("list_tools", |peer| async move {
            match peer.list_all_tools().await {
                Err(ServiceError::UnexpectedResponse) => {
                    peer.list_tools(None).await.map(|page| page.tools)
                }
                other => other,
            }
        })
        .await
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        if !self.supports(|caps| caps.resources.is_some()) {
            return Ok(Vec::new());
        }
        self.with_peer("list_resources", |peer| async move {
            peer.list_all_resources().await
        })
        .await
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        if !self.supports(|caps| caps.prompts.is_some()) {
            return Ok(Vec::new());
        }
        self.with_peer("list_prompts", |peer| async move {
            peer.list_all_prompts().await
        })
        .await
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        self.with_peer("call_tool", |peer| {
            let params = CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments: arguments.clone(),
                task: None,
            };
            async move { peer.call_tool(params).await }
        })
        .await
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.with_peer("read_resource", |peer| {
            let params = ReadResourceRequestParams {
                meta: None,
                uri: uri.to_owned(),
            };
            async move { peer.read_resource(params).await }
        })
        .await
    }

    async fn get_prompt(&self, name: &str, arguments: Option<JsonObject>) -> Result<GetPromptResult> {
        self.with_peer("get_prompt", |peer| {
            let params = GetPromptRequestParams {
                meta: None,
                name: name.to_owned(),
                arguments: arguments.clone(),
            };
            async move { peer.get_prompt(params).await }
        })
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(session) = self.session.lock().await.take() {
            match session.cancel().await {
                Ok(reason) => tracing::debug!(backend = %self.name, ?reason, "backend session closed"),
                Err(error) => tracing::warn!(backend = %self.name, %error, "backend session did not shut down cleanly"),
            }
        }
    }
}

impl McpClient {
    /// Whether the server advertised a capability; unknown peers are assumed capable.
    fn supports(&self, check: impl Fn(&rmcp::model::ServerCapabilities) -> bool) -> bool {
        let Ok(peer) = self.current_peer() else {
            return false;
        };
        peer.peer_info()
            .map(|info| check(&info.capabilities))
            .unwrap_or(true)
    }
}

async fn connect_with_protocol_fallback(
    transport: &mut dyn McpTransport,
    client_info: &Implementation,
) -> std::result::Result<McpRunningService, ClientInitializeError> {
    let latest = ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        client_info: client_info.clone(),
        ..Default::default()
    };

    match transport.connect(latest).await {
        Ok(session) => return Ok(session),
        Err(error) if should_retry_protocol_fallback(&error) => {
            tracing::debug!(endpoint = %transport.describe(), "retrying initialize with 2024-11-05 protocol");
        }
        Err(error) => return Err(error),
    }

    let fallback = ClientInfo {
        protocol_version: ProtocolVersion::V_2024_11_05,
        client_info: client_info.clone(),
        ..Default::default()
    };
    transport.connect(fallback).await
}

fn should_reconnect_after_service_error(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::TransportClosed | ServiceError::TransportSend(_) | ServiceError::Cancelled { .. }
    )
}

fn should_retry_protocol_fallback(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

fn map_client_initialize_error(backend: &str, error: ClientInitializeError) -> HubError {
    let message = match error {
        ClientInitializeError::ConnectionClosed(context) => {
            format!("initialize connection closed: {context}")
        }
        ClientInitializeError::TransportError { error, context } => {
            format!("initialize transport error ({context}): {error}")
        }
        ClientInitializeError::JsonRpcError(error) => {
            format!("initialize JSON-RPC error {}: {}", error.code.0, error.message)
        }
        ClientInitializeError::Cancelled => "initialize cancelled".to_string(),
        other => format!("initialize error: {other}"),
    };
    HubError::backend(backend, message)
}

fn map_service_error(backend: &str, context: &str, error: ServiceError) -> HubError {
    match error {
        ServiceError::McpError(error) => HubError::backend(
            backend,
            format!("{context}: MCP error {}: {}", error.code.0, error.message),
        ),
        ServiceError::TransportSend(error) => {
            HubError::Stream(format!("{backend} {context}: transport send failed: {error}"))
        }
        ServiceError::TransportClosed => {
            HubError::Stream(format!("{backend} {context}: transport closed"))
        }
        ServiceError::UnexpectedResponse => {
            HubError::backend(backend, format!("{context}: unexpected MCP response"))
        }
        ServiceError::Cancelled { reason } => {
            let suffix = reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            HubError::Stream(format!("{backend} {context}: request cancelled{suffix}"))
        }
        ServiceError::Timeout { timeout } => HubError::Timeout(timeout.as_millis() as u64),
        other => HubError::backend(backend, format!("{context}: MCP service error: {other}")),
    }
}
