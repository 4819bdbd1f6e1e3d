//! Merges many backend connections into one namespaced catalog.
//!
//! All state lives behind one synchronous mutex that is never held across an
//! await: connects, discovery and closes happen outside the critical sections,
//! and a per-entry generation counter discards results that were pruned or
//! replaced while their I/O was in flight.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmcp::model::{
    CallToolResult, GetPromptResult, Implementation, JsonObject, Prompt, ReadResourceResult,
    Resource, Tool,
};
use serde::Serialize;
use strum::Display;

use super::backend::{discover, BackendCatalog, BackendConnection, BackendConnector, TargetSpec};
use super::chain::{chain_descriptor, run_chain, ToolInvoker};
use super::registry::{Registration, ToolFilter, ToolOrigin, ToolRegistry};
use crate::error::{HubError, Result};
use crate::naming::{exposed_name, DEFAULT_NAMESPACE};
use crate::types::{NodeKind, ToolChainSpec};

/// Connection state of one backend as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetStatus {
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetClientStatus {
    pub name: String,
    pub kind: NodeKind,
    pub status: TargetStatus,
    pub tools_count: usize,
    pub resources_count: usize,
    pub prompts_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// One merged catalog entry, enabled or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub origin: ToolOrigin,
    pub input_schema: serde_json::Value,
}

struct TargetEntry {
    spec: TargetSpec,
    generation: u64,
    status: TargetStatus,
    connection: Option<Arc<dyn BackendConnection>>,
    catalog: BackendCatalog,
    error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

struct ResourceRoute {
    backend: String,
    resource: Resource,
}

struct PromptRoute {
    backend: String,
    native: String,
    prompt: Prompt,
}

struct ComposerState {
    namespace: String,
    order: Vec<String>,
    targets: HashMap<String, TargetEntry>,
    chains: BTreeMap<String, ToolChainSpec>,
    allow_list: Vec<String>,
    tools: ToolRegistry,
    resources: BTreeMap<String, ResourceRoute>,
    prompts: BTreeMap<String, PromptRoute>,
    next_generation: u64,
}

enum ToolRoute {
    Backend {
        backend: String,
        native: String,
        connection: Arc<dyn BackendConnection>,
    },
    Chain(ToolChainSpec),
}

/// Aggregates named backend connections for one virtual server.
pub struct Composer {
    connector: Arc<dyn BackendConnector>,
    instance_id: Arc<str>,
    state: Mutex<ComposerState>,
}

impl Composer {
    pub fn new(connector: Arc<dyn BackendConnector>, instance_id: impl Into<Arc<str>>) -> Self {
        Self {
            connector,
            instance_id: instance_id.into(),
            state: Mutex::new(ComposerState {
                namespace: DEFAULT_NAMESPACE.to_string(),
                order: Vec::new(),
                targets: HashMap::new(),
                chains: BTreeMap::new(),
                allow_list: Vec::new(),
                tools: ToolRegistry::default(),
                resources: BTreeMap::new(),
                prompts: BTreeMap::new(),
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ComposerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn namespace(&self) -> String {
        self.lock().namespace.clone()
    }

    /// Prefix applied the next time backend catalogs are merged.
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.lock().namespace = namespace.into();
    }

    /// Connect a backend, discover its catalog and merge it.
    ///
    /// Failures are recorded as the target's `error` status and returned; sibling
    /// targets are unaffected. Re-adding an unchanged, connected target only
    /// re-merges its cached catalog under the current namespace.
    pub async fn add(&self, target: &TargetSpec, client_info: &Implementation) -> Result<()> {
        let (generation, stale) = {
            let mut state = self.lock();
            let existing = state
                .targets
                .get(&target.name)
                .filter(|entry| entry.spec == *target)
                .map(|entry| entry.status);
            match existing {
                Some(TargetStatus::Connected) => {
                    state.merge_catalog(&self.instance_id, &target.name);
                    return Ok(());
                }
                Some(TargetStatus::Connecting) => return Ok(()),
                Some(TargetStatus::Error) | None => {}
            }
            let stale = state.detach_target(&target.name, false);
            state.next_generation += 1;
            let generation = state.next_generation;
            if !state.order.contains(&target.name) {
                state.order.push(target.name.clone());
            }
            state.targets.insert(
                target.name.clone(),
                TargetEntry {
                    spec: target.clone(),
                    generation,
                    status: TargetStatus::Connecting,
                    connection: None,
                    catalog: BackendCatalog::default(),
                    error: None,
                    connected_at: None,
                },
            );
            (generation, stale)
        };

        if let Some(stale) = stale {
            stale.close().await;
        }

        tracing::info!(
            instance_id = %self.instance_id,
            category = "backend",
            backend = %target.name,
            kind = %target.endpoint.kind(),
            "connecting backend"
        );

        match self.connect_and_discover(target, client_info).await {
            Ok((connection, catalog)) => {
                let tools = catalog.tools.len();
                let accepted = {
                    let mut state = self.lock();
                    match state.targets.get_mut(&target.name) {
                        Some(entry) if entry.generation == generation => {
                            entry.connection = Some(Arc::clone(&connection));
                            entry.catalog = catalog;
                            entry.status = TargetStatus::Connected;
                            entry.connected_at = Some(Utc::now());
                            state.merge_catalog(&self.instance_id, &target.name);
                            true
                        }
                        _ => false,
                    }
                };
                if accepted {
                    tracing::info!(
                        instance_id = %self.instance_id,
                        category = "backend",
                        backend = %target.name,
                        tools,
                        "backend connected"
                    );
                } else {
                    tracing::debug!(backend = %target.name, "backend removed while connecting, closing");
                    connection.close().await;
                }
                Ok(())
            }
            Err(error) => {
                {
                    let mut state = self.lock();
                    if let Some(entry) = state.targets.get_mut(&target.name) {
                        if entry.generation == generation {
                            entry.status = TargetStatus::Error;
                            entry.error = Some(error.to_string());
                        }
                    }
                }
                tracing::error!(
                    instance_id = %self.instance_id,
                    category = "backend",
                    backend = %target.name,
                    %error,
                    "failed to add backend"
                );
                Err(error)
            }
        }
    }

    async fn connect_and_discover(
        &self,
        target: &TargetSpec,
        client_info: &Implementation,
    ) -> Result<(Arc<dyn BackendConnection>, BackendCatalog)> {
        let connection = self.connector.connect(target, client_info).await?;
        match discover(&target.name, connection.as_ref()).await {
            Ok(catalog) => Ok((connection, catalog)),
            Err(error) => {
                connection.close().await;
                Err(error)
            }
        }
    }

    /// Remove every target not named in `desired`. Targets in both are untouched.
    pub async fn prune_targets(&self, desired: &BTreeSet<String>) -> Vec<String> {
        let removed: Vec<(String, Option<Arc<dyn BackendConnection>>)> = {
            let mut state = self.lock();
            let doomed: Vec<String> = state
                .order
                .iter()
                .filter(|name| !desired.contains(*name))
                .cloned()
                .collect();
            doomed
                .into_iter()
                .map(|name| {
                    let connection = state.detach_target(&name, true);
                    (name, connection)
                })
                .collect()
        };

        let mut names = Vec::with_capacity(removed.len());
        for (name, connection) in removed {
            if let Some(connection) = connection {
                connection.close().await;
            }
            tracing::info!(
                instance_id = %self.instance_id,
                category = "backend",
                backend = %name,
                "backend pruned"
            );
            names.push(name);
        }
        names
    }

    /// Register (or re-register) a chain tool under its own name.
    pub fn compose_tool_chain(&self, spec: &ToolChainSpec) -> Result<()> {
        spec.validate()?;
        let mut state = self.lock();
        state.chains.insert(spec.name.clone(), spec.clone());
        if let Some(displaced) = state.tools.register_chain(chain_descriptor(spec)) {
            tracing::warn!(
                instance_id = %self.instance_id,
                category = "tool",
                chain = %spec.name,
                displaced = ?displaced.origin,
                "tool chain shadows a backend tool"
            );
        }
        state.refresh_filter();
        Ok(())
    }

    /// Drop chains that are no longer configured.
    ///
    /// Connected backends are re-merged afterwards so a tool a dropped chain
    /// shadowed becomes reachable again.
    pub fn retain_tool_chains(&self, keep: &BTreeSet<String>) {
        let mut state = self.lock();
        state.chains.retain(|name, _| keep.contains(name));
        if state.tools.retain_chains(keep) > 0 {
            let connected: Vec<String> = state
                .order
                .iter()
                .filter(|name| {
                    state
                        .targets
                        .get(name.as_str())
                        .is_some_and(|entry| entry.status == TargetStatus::Connected)
                })
                .cloned()
                .collect();
            for name in connected {
                state.merge_catalog(&self.instance_id, &name);
            }
        }
        state.refresh_filter();
    }

    /// Apply an allow-list. Empty enables everything; chains are always enabled.
    pub fn set_tool_filter(&self, allow: &[String]) {
        let mut state = self.lock();
        state.allow_list = allow.to_vec();
        state.refresh_filter();
    }

    pub fn list_target_clients(&self) -> Vec<TargetClientStatus> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|name| state.targets.get(name))
            .map(|entry| TargetClientStatus {
                name: entry.spec.name.clone(),
                kind: entry.spec.endpoint.kind(),
                status: entry.status,
                tools_count: state.tools.count_for_backend(&entry.spec.name),
                resources_count: state
                    .resources
                    .values()
                    .filter(|route| route.backend == entry.spec.name)
                    .count(),
                prompts_count: state
                    .prompts
                    .values()
                    .filter(|route| route.backend == entry.spec.name)
                    .count(),
                error: entry.error.clone(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    pub fn target_names(&self) -> BTreeSet<String> {
        self.lock().order.iter().cloned().collect()
    }

    /// Full merged catalog including disabled entries.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let state = self.lock();
        state
            .tools
            .iter()
            .map(|(name, entry)| ToolDescriptor {
                name: name.clone(),
                description: entry.descriptor.description.as_deref().map(str::to_string),
                enabled: entry.enabled,
                origin: entry.origin.clone(),
                input_schema: serde_json::Value::Object((*entry.descriptor.input_schema).clone()),
            })
            .collect()
    }

    /// Tools a consumer may see and call.
    pub fn enabled_tools(&self) -> Vec<Tool> {
        self.lock().tools.enabled_descriptors()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.lock()
            .resources
            .values()
            .map(|route| route.resource.clone())
            .collect()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.lock()
            .prompts
            .values()
            .map(|route| route.prompt.clone())
            .collect()
    }

    /// Consumer-facing call: hidden and unknown tools are both "not found".
    pub async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let visible = self.lock().tools.get(name).is_some_and(|entry| entry.enabled);
        if !visible {
            return Err(HubError::not_found("tool", name));
        }
        self.invoke(name, arguments, 0).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let connection = {
            let state = self.lock();
            let route = state
                .resources
                .get(uri)
                .ok_or_else(|| HubError::not_found("resource", uri))?;
            state.connection_for(&route.backend)?
        };
        connection.read_resource(uri).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<JsonObject>) -> Result<GetPromptResult> {
        let (native, connection) = {
            let state = self.lock();
            let route = state
                .prompts
                .get(name)
                .ok_or_else(|| HubError::not_found("prompt", name))?;
            (route.native.clone(), state.connection_for(&route.backend)?)
        };
        connection.get_prompt(&native, arguments).await
    }

    /// Close every backend. The composer is empty afterwards.
    pub async fn close(&self) {
        let connections: Vec<(String, Arc<dyn BackendConnection>)> = {
            let mut state = self.lock();
            let names = std::mem::take(&mut state.order);
            names
                .into_iter()
                .filter_map(|name| {
                    let connection = state.detach_target(&name, true)?;
                    Some((name, connection))
                })
                .collect()
        };
        for (name, connection) in connections {
            connection.close().await;
            tracing::debug!(backend = %name, "backend closed");
        }
    }

    fn route(&self, name: &str) -> Result<ToolRoute> {
        let state = self.lock();
        let entry = state
            .tools
            .get(name)
            .ok_or_else(|| HubError::not_found("tool", name))?;
        match &entry.origin {
            ToolOrigin::Backend { backend, native } => Ok(ToolRoute::Backend {
                backend: backend.clone(),
                native: native.clone(),
                connection: state.connection_for(backend)?,
            }),
            ToolOrigin::Chain => state
                .chains
                .get(name)
                .cloned()
                .map(ToolRoute::Chain)
                .ok_or_else(|| HubError::not_found("tool chain", name)),
        }
    }
}

#[async_trait]
impl ToolInvoker for Composer {
    async fn invoke(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        depth: usize,
    ) -> Result<CallToolResult> {
        match self.route(name)? {
            ToolRoute::Backend {
                backend,
                native,
                connection,
            } => {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    category = "tool",
                    tool = name,
                    backend = %backend,
                    "routing tool call"
                );
                connection.call_tool(&native, arguments).await
            }
            ToolRoute::Chain(spec) => run_chain(&spec, arguments, self, depth).await,
        }
    }
}

impl ComposerState {
    /// Remove a target's catalog contributions, optionally forgetting it entirely.
    fn detach_target(&mut self, name: &str, forget: bool) -> Option<Arc<dyn BackendConnection>> {
        self.tools.remove_backend(name);
        self.resources.retain(|_, route| route.backend != name);
        self.prompts.retain(|_, route| route.backend != name);
        if forget {
            self.order.retain(|n| n != name);
        }
        self.targets.remove(name).and_then(|entry| entry.connection)
    }

    fn merge_catalog(&mut self, instance_id: &str, name: &str) {
        let Some(entry) = self.targets.get(name) else {
            return;
        };
        self.tools.remove_backend(name);
        self.resources.retain(|_, route| route.backend != name);
        self.prompts.retain(|_, route| route.backend != name);

        for tool in &entry.catalog.tools {
            let native = tool.name.to_string();
            let exposed = exposed_name(&self.namespace, name, &native);
            if let Registration::Conflict { owner } =
                self.tools
                    .register_backend_tool(exposed.clone(), name, &native, tool.clone())
            {
                tracing::warn!(
                    instance_id,
                    category = "tool",
                    backend = name,
                    tool = %exposed,
                    ?owner,
                    "tool name already taken, skipping"
                );
            }
        }

        for resource in &entry.catalog.resources {
            let uri = resource.uri.clone();
            if let Some(existing) = self.resources.get(&uri) {
                tracing::warn!(instance_id, backend = name, uri = %uri, owner = %existing.backend, "resource uri already taken, skipping");
                continue;
            }
            self.resources.insert(
                uri,
                ResourceRoute {
                    backend: name.to_string(),
                    resource: resource.clone(),
                },
            );
        }

        for prompt in &entry.catalog.prompts {
            let native = prompt.name.to_string();
            let exposed = exposed_name(&self.namespace, name, &native);
            if self.prompts.contains_key(&exposed) {
                tracing::warn!(instance_id, backend = name, prompt = %exposed, "prompt name already taken, skipping");
                continue;
            }
            let mut prompt = prompt.clone();
            prompt.name = exposed.clone().into();
            self.prompts.insert(
                exposed,
                PromptRoute {
                    backend: name.to_string(),
                    native,
                    prompt,
                },
            );
        }
    }

    fn refresh_filter(&mut self) {
        let chains: Vec<String> = self.chains.keys().cloned().collect();
        self.tools
            .set_filter(ToolFilter::new(self.allow_list.iter().cloned(), chains));
    }

    fn connection_for(&self, backend: &str) -> Result<Arc<dyn BackendConnection>> {
        self.targets
            .get(backend)
            .and_then(|entry| entry.connection.clone())
            .ok_or_else(|| HubError::backend(backend, "backend is not connected"))
    }
}
