//! Virtual MCP server backed by a composer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams, GetPromptResult,
    Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, ProtocolVersion, ReadResourceRequestParams, ReadResourceResult,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{Peer, RequestContext, RoleServer, ServiceExt};
use rmcp::transport::IntoTransport;
use rmcp::{ErrorData as McpError, ServerHandler};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::composer::Composer;
use crate::error::{HubError, Result};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol face of a composer.
#[derive(Clone)]
struct CatalogHandler {
    composer: Arc<Composer>,
    server_info: Implementation,
    label: Arc<str>,
}

impl ServerHandler for CatalogHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_resources_list_changed()
                .enable_prompts()
                .enable_prompts_list_changed()
                .build(),
            server_info: self.server_info.clone(),
            instructions: Some(
                "Aggregated tools from every backend configured for this instance.".to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        let tools = self.composer.enabled_tools();
        tracing::debug!(
            server = %self.label,
            request_id = %context.id,
            tool_count = tools.len(),
            "tools/list"
        );
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let tool_name = request.name.to_string();
        tracing::debug!(server = %self.label, request_id = %context.id, tool = %tool_name, "tools/call");

        match self.composer.call_tool(&tool_name, request.arguments).await {
            Ok(result) => Ok(result),
            Err(error) if error.is_not_found() => Err(McpError::invalid_params(
                format!("Tool not found: {tool_name}"),
                None,
            )),
            Err(error) => {
                tracing::warn!(server = %self.label, tool = %tool_name, %error, "tools/call failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error: {error}"
                ))]))
            }
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            resources: self.composer.list_resources(),
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ReadResourceResult, McpError> {
        self.composer
            .read_resource(&request.uri)
            .await
            .map_err(|error| match error {
                HubError::NotFound { .. } => McpError::resource_not_found(
                    format!("Resource not found: {}", request.uri),
                    None,
                ),
                other => McpError::internal_error(other.to_string(), None),
            })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            prompts: self.composer.list_prompts(),
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<GetPromptResult, McpError> {
        self.composer
            .get_prompt(&request.name, request.arguments)
            .await
            .map_err(|error| match error {
                HubError::NotFound { .. } => {
                    McpError::invalid_params(format!("Prompt not found: {}", request.name), None)
                }
                other => McpError::internal_error(other.to_string(), None),
            })
    }
}

#[derive(Default)]
struct ServingState {
    connected: bool,
    catalog_at_connect: Option<Vec<String>>,
    task: Option<JoinHandle<()>>,
}

/// One virtual server: a composer plus at most one transport connection.
///
/// Capabilities must be registered on the composer before [`VirtualServer::connect`];
/// the catalog visible at that moment is recorded for inspection.
pub struct VirtualServer {
    handler: CatalogHandler,
    state: Mutex<ServingState>,
    peer: Arc<Mutex<Option<Peer<RoleServer>>>>,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl VirtualServer {
    pub fn new(composer: Arc<Composer>, server_info: Implementation, label: impl Into<Arc<str>>) -> Self {
        Self {
            handler: CatalogHandler {
                composer,
                server_info,
                label: label.into(),
            },
            state: Mutex::new(ServingState::default()),
            peer: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn composer(&self) -> &Arc<Composer> {
        &self.handler.composer
    }

    pub fn label(&self) -> &str {
        &self.handler.label
    }

    /// Attach a transport and start serving in the background.
    ///
    /// Returns once the service task is spawned; the protocol handshake completes
    /// whenever the peer sends `initialize`.
    pub fn connect<T, E, A>(&self, transport: T) -> Result<()>
    where
        T: IntoTransport<RoleServer, E, A> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        A: 'static,
    {
        let mut state = self.lock();
        if self.cancel.is_cancelled() {
            return Err(HubError::InvalidState(format!(
                "virtual server {} is closed",
                self.handler.label
            )));
        }
        if state.connected {
            return Err(HubError::InvalidState(format!(
                "virtual server {} is already connected",
                self.handler.label
            )));
        }

        let catalog: Vec<String> = self
            .handler
            .composer
            .enabled_tools()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        tracing::debug!(server = %self.handler.label, tools = catalog.len(), "connecting virtual server");
        state.connected = true;
        state.catalog_at_connect = Some(catalog);

        let handler = self.handler.clone();
        let label = Arc::clone(&self.handler.label);
        let ct = self.cancel.child_token();
        let stopped = self.stopped.clone();
        let peer_slot = Arc::clone(&self.peer);
        state.task = Some(tokio::spawn(async move {
            match handler.serve_with_ct(transport, ct).await {
                Ok(running) => {
                    *peer_slot.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(running.peer().clone());
                    match running.waiting().await {
                        Ok(reason) => tracing::debug!(server = %label, ?reason, "virtual server stopped"),
                        Err(error) => tracing::warn!(server = %label, %error, "virtual server task failed"),
                    }
                }
                Err(error) => {
                    tracing::warn!(server = %label, %error, "virtual server handshake failed");
                }
            }
            peer_slot.lock().unwrap_or_else(|p| p.into_inner()).take();
            stopped.cancel();
        }));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Tool names that were visible when the transport was attached.
    pub fn catalog_at_connect(&self) -> Option<Vec<String>> {
        self.lock().catalog_at_connect.clone()
    }

    /// Resolves once the service has stopped (peer left, transport closed or `close`).
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Tell an initialized peer that the catalog changed.
    pub async fn notify_catalog_changed(&self) {
        let peer = self.peer.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let Some(peer) = peer else {
            return;
        };
        if let Err(error) = peer.notify_tool_list_changed().await {
            tracing::debug!(server = %self.handler.label, %error, "tool list notification not delivered");
        }
        let _ = peer.notify_resource_list_changed().await;
        let _ = peer.notify_prompt_list_changed().await;
    }

    /// Stop serving and close every backend owned by the composer.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.lock().task.take();
        if let Some(task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                tracing::warn!(server = %self.handler.label, "virtual server did not stop in time");
            }
        }
        self.stopped.cancel();
        self.handler.composer.close().await;
    }
}
