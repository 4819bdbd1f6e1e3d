//! Registry of live routers keyed by instance id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmcp::model::Implementation;
use serde::Serialize;
use strum::Display;

use super::store::InstanceStore;
use crate::error::{HubError, Result};
use crate::logging::{emit, LogLevel};
use crate::mcp::{BackendConnector, RmcpConnector, TargetStatus, ToolDescriptor};
use crate::naming::derive_node_name;
use crate::router::{
    Router, RouterConfig, RouterOptions, TransportMode, UpdateOptions, DEFAULT_RECONNECT_DELAY,
};
use crate::types::{Instance, InstancePatch, InstanceStatus, NewInstance, NodeKind, NodeSpec};

/// Live state of one declared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeState {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl From<TargetStatus> for NodeState {
    fn from(status: TargetStatus) -> Self {
        match status {
            TargetStatus::Connecting => Self::Connecting,
            TargetStatus::Connected => Self::Connected,
            TargetStatus::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusView {
    pub node_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeState,
    pub tools_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct InstanceManager {
    store: Arc<dyn InstanceStore>,
    connector: Arc<dyn BackendConnector>,
    reconnect_delay: Duration,
    public_base: Option<String>,
    routers: RwLock<HashMap<String, Arc<Router>>>,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceManager {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            connector: Arc::new(RmcpConnector),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            public_base: None,
            routers: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Base URL used to derive a default access address for new instances.
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.public_base = Some(base.trim_end_matches('/').to_string()).filter(|b| !b.is_empty());
        self
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Start/stop/restart/update of one instance run one at a time.
    fn lifecycle_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    pub fn router(&self, id: &str) -> Option<Arc<Router>> {
        self.routers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn insert_router(&self, id: &str, router: Arc<Router>) {
        self.routers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string(), router);
    }

    fn take_router(&self, id: &str) -> Option<Arc<Router>> {
        self.routers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }

    async fn require(&self, id: &str) -> Result<Instance> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| HubError::not_found("instance", id))
    }

    async fn set_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        self.store
            .update(id, InstancePatch::status(status))
            .await?
            .ok_or_else(|| HubError::not_found("instance", id))
    }

    /// Restart every instance persisted as running. Returns how many came up.
    pub async fn initialize(&self) -> Result<usize> {
        let mut started = 0;
        for instance in self.store.list().await? {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            match self.start_instance(&instance.id).await {
                Ok(_) => started += 1,
                Err(error) => {
                    tracing::error!(instance_id = %instance.id, category = "instance", %error, "failed to restore instance");
                    let _ = self.set_status(&instance.id, InstanceStatus::Error).await;
                }
            }
        }
        Ok(started)
    }

    pub async fn create_instance(&self, new: NewInstance) -> Result<Instance> {
        new.validate()?;
        let mut instance = Instance::create(new, Utc::now());
        if instance.access_address.is_none() {
            instance.access_address = self
                .public_base
                .as_ref()
                .map(|base| format!("{base}/api/mcp/{}/sse", instance.id));
        }
        let instance = self.store.create(instance).await?;
        emit(
            LogLevel::Info,
            "instance",
            format!("Instance {} created", instance.name),
            Some(&instance.id),
        );
        Ok(instance)
    }

    pub async fn start_instance(&self, id: &str) -> Result<Instance> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &str) -> Result<Instance> {
        let instance = self.require(id).await?;
        if self.router(id).is_some() {
            return Ok(instance);
        }

        emit(
            LogLevel::Info,
            "instance",
            format!("Starting instance {} ({id})", instance.name),
            Some(id),
        );
        let router = Arc::new(Router::new(
            RouterOptions::builder()
                .instance_id(id)
                .mode(TransportMode::Stream)
                .reconnect_delay(self.reconnect_delay)
                .connector(Arc::clone(&self.connector))
                .server_info(Implementation {
                    name: instance.name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Implementation::default()
                })
                .build(),
        ));

        let started = async {
            router
                .import_config(&RouterConfig::from_instance(&instance))
                .await?;
            router.start().await
        }
        .await;
        if let Err(error) = started {
            router.close().await;
            let _ = self.set_status(id, InstanceStatus::Error).await;
            emit(
                LogLevel::Error,
                "instance",
                format!("Failed to start instance {}: {error}", instance.name),
                Some(id),
            );
            return Err(error);
        }

        if let Some(address) = instance.outbound_address() {
            if let Err(error) = router.connect_outbound(address).await {
                tracing::warn!(instance_id = %id, category = "outbound", %error, "outbound registration not started");
            }
        }

        self.insert_router(id, router);
        let instance = self.set_status(id, InstanceStatus::Running).await?;
        emit(
            LogLevel::Info,
            "instance",
            format!("Instance {} running", instance.name),
            Some(id),
        );
        Ok(instance)
    }

    pub async fn stop_instance(&self, id: &str) -> Result<Instance> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<Instance> {
        if let Some(router) = self.take_router(id) {
            router.close().await;
        }
        let instance = self.set_status(id, InstanceStatus::Stopped).await?;
        emit(
            LogLevel::Info,
            "instance",
            format!("Instance {} stopped", instance.name),
            Some(id),
        );
        Ok(instance)
    }

    pub async fn restart_instance(&self, id: &str) -> Result<Instance> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.require(id).await?;
        self.set_status(id, InstanceStatus::Restarting).await?;
        self.stop_locked(id).await?;
        self.start_locked(id).await
    }

    /// Replace the node set; a running instance is reconfigured in place.
    pub async fn update_nodes(&self, id: &str, nodes: Vec<NodeSpec>) -> Result<Instance> {
        self.update_instance(id, InstancePatch::nodes(nodes)).await
    }

    /// Persist a patch. Running instances pick up node, chain, filter and
    /// namespace changes through a hot update rather than a restart.
    pub async fn update_instance(&self, id: &str, patch: InstancePatch) -> Result<Instance> {
        patch.validate()?;
        let reconfigures = patch.nodes.is_some()
            || patch.tool_chains.is_some()
            || patch.tools.is_some()
            || patch.namespace.is_some();

        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        let instance = self
            .store
            .update(id, patch)
            .await?
            .ok_or_else(|| HubError::not_found("instance", id))?;

        if let (true, Some(router)) = (reconfigures, self.router(id)) {
            router
                .update_config(&instance.nodes, UpdateOptions::from_instance(&instance))
                .await?;
            emit(
                LogLevel::Info,
                "instance",
                format!("Instance {} reconfigured with {} node(s)", instance.name, instance.nodes.len()),
                Some(id),
            );
        }
        Ok(instance)
    }

    pub async fn delete_instance(&self, id: &str) -> Result<bool> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        if let Some(router) = self.take_router(id) {
            router.close().await;
        }
        let deleted = self.store.delete(id).await?;
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        Ok(deleted)
    }

    /// Cross-reference declared nodes with the live composer by derived name.
    pub async fn node_statuses(&self, id: &str) -> Result<Vec<NodeStatusView>> {
        let instance = self.require(id).await?;
        let live = self
            .router(id)
            .map(|router| router.composer().list_target_clients());

        Ok(instance
            .nodes
            .iter()
            .map(|node| {
                let name = derive_node_name(node);
                let client = live
                    .as_ref()
                    .and_then(|clients| clients.iter().find(|c| c.name == name));
                let (status, tools_count, error, connected_at) = match (&live, client) {
                    (None, _) => (NodeState::Disconnected, 0, None, None),
                    (Some(_), Some(client)) => (
                        client.status.into(),
                        client.tools_count,
                        client.error.clone(),
                        client.connected_at,
                    ),
                    (Some(_), None) => (
                        NodeState::Error,
                        0,
                        Some("backend is not registered with the running instance".to_string()),
                        None,
                    ),
                };
                NodeStatusView {
                    node_id: node.id.clone(),
                    name,
                    kind: node.endpoint.kind(),
                    status,
                    tools_count,
                    error,
                    connected_at,
                }
            })
            .collect())
    }

    /// Merged catalog of a running instance, disabled tools included.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>> {
        self.require(id).await?;
        let router = self
            .router(id)
            .ok_or_else(|| HubError::InvalidState(format!("instance {id} is not running")))?;
        Ok(router.composer().list_tools())
    }

    /// Close every router. Persisted statuses are kept so `initialize` can restore them.
    pub async fn shutdown(&self) {
        let routers: Vec<(String, Arc<Router>)> = self
            .routers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        for (id, router) in routers {
            router.close().await;
            tracing::info!(instance_id = %id, category = "instance", "instance closed on shutdown");
        }
    }
}
