//! Per-instance router: owns the default virtual server, the stream-mode
//! session registry and the outbound registration clients.
//!
//! Every path that creates a virtual server (default server, session, outbound
//! attempt) applies the parsed configuration to a composer before the server is
//! connected to its transport.

pub mod config;
pub mod outbound;
pub mod session;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use chrono::Utc;
use rmcp::model::Implementation;
use rmcp::service::RoleServer;
use rmcp::transport::IntoTransport;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::DropGuard;

use crate::error::{HubError, Result};
use crate::mcp::{
    channel_transport, BackendConnector, Composer, DeliveryReport, RmcpConnector, VirtualServer,
};
use crate::types::NodeSpec;

pub use config::{ParsedConfig, RouterConfig, UpdateOptions};
pub use outbound::{
    ActiveOutbound, OutboundClient, OutboundConnection, ServerFactory, DEFAULT_RECONNECT_DELAY,
};
pub use session::{Session, SessionRegistry};

/// How consumers reach the router. Fixed for the router's lifetime.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stream,
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RouterState {
    Uninitialized,
    Configured,
    Serving,
    Closed,
}

/// Construction options.
#[derive(Builder)]
pub struct RouterOptions {
    #[builder(into)]
    instance_id: String,
    #[builder(default)]
    mode: TransportMode,
    #[builder(default = DEFAULT_RECONNECT_DELAY)]
    reconnect_delay: Duration,
    connector: Option<Arc<dyn BackendConnector>>,
    server_info: Option<Implementation>,
}

/// Implementation info the gateway presents to consumers and backends.
pub fn hub_implementation() -> Implementation {
    Implementation {
        name: "mcp-hub".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Implementation::default()
    }
}

/// Handle returned to the stream transport when a session opens.
///
/// Dropping `guard` (for example when the event stream ends) closes the session.
pub struct OpenedSession {
    pub id: String,
    pub outlet: UnboundedReceiver<String>,
    pub guard: DropGuard,
}

/// State shared with outbound supervisors.
struct RouterCore {
    instance_id: Arc<str>,
    connector: Arc<dyn BackendConnector>,
    server_info: Implementation,
    parsed: RwLock<Option<ParsedConfig>>,
}

impl RouterCore {
    fn parsed(&self) -> Option<ParsedConfig> {
        self.parsed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store_parsed(&self, parsed: ParsedConfig) {
        *self
            .parsed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(parsed);
    }

    fn fresh_composer(&self) -> Arc<Composer> {
        Arc::new(Composer::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.instance_id),
        ))
    }

    /// Register everything `parsed` describes. Backends are added in declaration
    /// order and a failing backend never stops the ones after it.
    async fn apply_configuration(&self, composer: &Composer, parsed: &ParsedConfig) {
        composer.set_namespace(parsed.namespace.clone());
        composer.retain_tool_chains(&parsed.chain_names());

        for target in &parsed.targets {
            if let Err(error) = composer.add(target, &self.server_info).await {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    backend = %target.name,
                    %error,
                    "continuing without backend"
                );
            }
        }

        for chain in &parsed.tool_chains {
            if let Err(error) = composer.compose_tool_chain(chain) {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    category = "tool",
                    chain = %chain.name,
                    %error,
                    "skipping invalid tool chain"
                );
            }
        }
        composer.set_tool_filter(&parsed.tools_filter);
    }

    async fn configured_server(&self, label: String) -> Arc<VirtualServer> {
        let composer = self.fresh_composer();
        if let Some(parsed) = self.parsed() {
            self.apply_configuration(&composer, &parsed).await;
        }
        Arc::new(VirtualServer::new(composer, self.server_info.clone(), label))
    }
}

#[async_trait]
impl ServerFactory for RouterCore {
    async fn build_server(&self, label: String) -> Arc<VirtualServer> {
        self.configured_server(label).await
    }
}

pub struct Router {
    core: Arc<RouterCore>,
    mode: TransportMode,
    reconnect_delay: Duration,
    default_server: Arc<VirtualServer>,
    sessions: Arc<SessionRegistry>,
    outbound: tokio::sync::Mutex<BTreeMap<String, OutboundClient>>,
    active: Arc<ActiveOutbound>,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        let server_info = options.server_info.unwrap_or_else(hub_implementation);
        let core = Arc::new(RouterCore {
            instance_id: options.instance_id.into(),
            connector: options
                .connector
                .unwrap_or_else(|| Arc::new(RmcpConnector)),
            server_info,
            parsed: RwLock::new(None),
        });
        let default_server = Arc::new(VirtualServer::new(
            core.fresh_composer(),
            core.server_info.clone(),
            format!("{}:{}", options.mode, core.instance_id),
        ));
        Self {
            core,
            mode: options.mode,
            reconnect_delay: options.reconnect_delay,
            default_server,
            sessions: Arc::new(SessionRegistry::default()),
            outbound: tokio::sync::Mutex::new(BTreeMap::new()),
            active: Arc::new(ActiveOutbound::default()),
            state: Mutex::new(RouterState::Uninitialized),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.lock_state() == RouterState::Closed {
            return Err(HubError::InvalidState(format!(
                "router for instance {} is closed",
                self.core.instance_id
            )));
        }
        Ok(())
    }

    pub fn instance_id(&self) -> &str {
        &self.core.instance_id
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn state(&self) -> RouterState {
        *self.lock_state()
    }

    /// The long-lived composer used for status reporting and stdio serving.
    pub fn composer(&self) -> Arc<Composer> {
        Arc::clone(self.default_server.composer())
    }

    pub fn default_server(&self) -> Arc<VirtualServer> {
        Arc::clone(&self.default_server)
    }

    pub fn parsed_config(&self) -> Option<ParsedConfig> {
        self.core.parsed()
    }

    /// Parse `config` and apply it to the default composer.
    pub async fn import_config(&self, config: &RouterConfig) -> Result<()> {
        self.ensure_open()?;
        let parsed = ParsedConfig::parse(config);
        self.core.store_parsed(parsed.clone());
        self.core
            .apply_configuration(self.default_server.composer(), &parsed)
            .await;

        let mut state = self.lock_state();
        if *state == RouterState::Uninitialized {
            *state = RouterState::Configured;
        }
        tracing::info!(
            instance_id = %self.core.instance_id,
            category = "router",
            backends = parsed.targets.len(),
            chains = parsed.tool_chains.len(),
            namespace = %parsed.namespace,
            "configuration imported"
        );
        Ok(())
    }

    /// Begin serving. Stdio mode attaches the default server to the process's
    /// standard streams; stream mode waits for sessions.
    pub async fn start(&self) -> Result<()> {
        match self.mode {
            TransportMode::Stdio => self.serve_default(rmcp::transport::io::stdio()),
            TransportMode::Stream => {
                let mut state = self.lock_state();
                match *state {
                    RouterState::Uninitialized => Err(HubError::InvalidState(
                        "configuration must be imported before start".into(),
                    )),
                    RouterState::Closed => Err(HubError::InvalidState("router is closed".into())),
                    _ => {
                        *state = RouterState::Serving;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Connect the already configured default server to `transport`.
    pub fn serve_default<T, E, A>(&self, transport: T) -> Result<()>
    where
        T: IntoTransport<RoleServer, E, A> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        A: 'static,
    {
        let mut state = self.lock_state();
        match *state {
            RouterState::Uninitialized => {
                return Err(HubError::InvalidState(
                    "configuration must be imported before serving".into(),
                ))
            }
            RouterState::Closed => return Err(HubError::InvalidState("router is closed".into())),
            _ => {}
        }
        self.default_server.connect(transport)?;
        *state = RouterState::Serving;
        tracing::info!(instance_id = %self.core.instance_id, category = "router", mode = %self.mode, "default server connected");
        Ok(())
    }

    /// Hot reconfiguration: prune, re-apply, then rebuild every outbound client.
    ///
    /// Backends present in both the old and new node sets keep their connection.
    /// Open sessions keep the configuration they were opened with.
    pub async fn update_config(&self, nodes: &[NodeSpec], options: UpdateOptions) -> Result<()> {
        self.ensure_open()?;
        let previous = self.core.parsed();
        let parsed = ParsedConfig::merged(previous.as_ref(), nodes, options);
        self.core.store_parsed(parsed.clone());

        let composer = self.default_server.composer();
        let removed = composer.prune_targets(&parsed.target_names()).await;
        self.core.apply_configuration(composer, &parsed).await;
        if self.default_server.is_connected() {
            self.default_server.notify_catalog_changed().await;
        }

        {
            let mut state = self.lock_state();
            if *state == RouterState::Uninitialized {
                *state = RouterState::Configured;
            }
        }

        let rebuilt = self.rebuild_outbound().await;
        tracing::info!(
            instance_id = %self.core.instance_id,
            category = "router",
            backends = parsed.targets.len(),
            removed = removed.len(),
            outbound = rebuilt,
            "configuration updated"
        );
        Ok(())
    }

    async fn rebuild_outbound(&self) -> usize {
        let mut clients = self.outbound.lock().await;
        let addresses: Vec<String> = clients.keys().cloned().collect();
        for (_, client) in std::mem::take(&mut *clients) {
            client.shutdown().await;
        }
        for address in &addresses {
            clients.insert(address.clone(), self.spawn_outbound(address.clone()));
        }
        addresses.len()
    }

    fn spawn_outbound(&self, address: String) -> OutboundClient {
        OutboundClient::spawn(
            address,
            Arc::clone(&self.core) as Arc<dyn ServerFactory>,
            Arc::clone(&self.active),
            self.reconnect_delay,
        )
    }

    /// Open a stream-mode session with its own composer and server.
    pub async fn open_session(&self) -> Result<OpenedSession> {
        self.ensure_open()?;
        if self.mode != TransportMode::Stream {
            return Err(HubError::InvalidState(format!(
                "instance {} does not accept stream sessions in {} mode",
                self.core.instance_id, self.mode
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let server = self.core.configured_server(format!("session:{id}")).await;
        let (transport, peer) = channel_transport(id.as_str());
        if let Err(error) = server.connect(transport) {
            server.close().await;
            return Err(error);
        }

        let session = Arc::new(Session {
            server: Arc::clone(&server),
            inlet: peer.inlet,
            closed: peer.closed.clone(),
            opened_at: Utc::now(),
        });
        // registered under the state lock so close() either drains it or we see Closed
        let registered = {
            let state = self.lock_state();
            if *state == RouterState::Closed {
                Err(HubError::InvalidState(format!(
                    "router for instance {} is closed",
                    self.core.instance_id
                )))
            } else if !self.sessions.insert(id.clone(), session) {
                Err(HubError::InvalidState(format!("session id {id} already in use")))
            } else {
                Ok(())
            }
        };
        if let Err(error) = registered {
            server.close().await;
            return Err(error);
        }

        let sessions = Arc::clone(&self.sessions);
        let closed = peer.closed.clone();
        let watched_id = id.clone();
        let instance_id = Arc::clone(&self.core.instance_id);
        tokio::spawn(async move {
            tokio::select! {
                _ = server.stopped() => {}
                _ = closed.cancelled() => {}
            }
            if let Some(session) = sessions.remove(&watched_id) {
                session.closed.cancel();
                session.server.close().await;
                tracing::info!(%instance_id, category = "session", session_id = %watched_id, "session closed");
            }
        });

        tracing::info!(
            instance_id = %self.core.instance_id,
            category = "session",
            session_id = %id,
            "session opened"
        );
        Ok(OpenedSession {
            id,
            outlet: peer.outlet,
            guard: peer.closed.drop_guard(),
        })
    }

    /// Forward inbound data to a session. Unknown ids leave every session untouched.
    pub fn post_to_session(&self, session_id: &str, data: &str) -> Result<DeliveryReport> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::not_found("session", session_id))?;
        if session.inlet.is_closed() {
            return Err(HubError::not_found("session", session_id));
        }
        session.inlet.deliver(data)
    }

    /// Close a session's transport; the session watcher finishes the teardown.
    pub fn close_session(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.closed.cancel();
                true
            }
            None => false,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }

    pub fn session_server(&self, session_id: &str) -> Option<Arc<VirtualServer>> {
        self.sessions
            .get(session_id)
            .map(|session| Arc::clone(&session.server))
    }

    /// Start (or restart) the outbound registration for `address`.
    pub async fn connect_outbound(&self, address: &str) -> Result<()> {
        self.ensure_open()?;
        let address = address.trim();
        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            return Err(HubError::InvalidArgument(format!(
                "outbound address must be ws:// or wss://, got {address:?}"
            )));
        }

        let mut clients = self.outbound.lock().await;
        if let Some(existing) = clients.remove(address) {
            existing.shutdown().await;
        }
        clients.insert(address.to_string(), self.spawn_outbound(address.to_string()));
        tracing::info!(
            instance_id = %self.core.instance_id,
            category = "outbound",
            address,
            "outbound registration scheduled"
        );
        Ok(())
    }

    pub fn outbound_connections(&self) -> Vec<OutboundConnection> {
        self.active.list()
    }

    pub fn outbound_servers(&self) -> Vec<Arc<VirtualServer>> {
        self.active.servers()
    }

    /// Tear everything down. Collections are cleared even if individual closes stall.
    pub async fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == RouterState::Closed {
                return;
            }
            *state = RouterState::Closed;
        }

        self.default_server.close().await;

        for (id, session) in self.sessions.drain() {
            session.closed.cancel();
            session.server.close().await;
            tracing::debug!(instance_id = %self.core.instance_id, session_id = %id, "session closed on shutdown");
        }

        let clients = std::mem::take(&mut *self.outbound.lock().await);
        for (_, client) in clients {
            client.shutdown().await;
        }
        self.active.clear();

        tracing::info!(instance_id = %self.core.instance_id, category = "router", "router closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_support::ScriptedConnector;
    use crate::types::ToolChainSpec;
    use pretty_assertions::assert_eq;
    use rmcp::model::ClientInfo;
    use rmcp::ServiceExt;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;

    fn router_with(connector: &Arc<ScriptedConnector>, mode: TransportMode) -> Router {
        Router::new(
            RouterOptions::builder()
                .instance_id("inst-1")
                .mode(mode)
                .connector(Arc::clone(connector) as Arc<dyn BackendConnector>)
                .build(),
        )
    }

    fn node(name: &str) -> NodeSpec {
        NodeSpec::stdio(name, format!("/opt/mcp/{name}"), vec![]).with_name(name)
    }

    fn config(names: &[&str]) -> RouterConfig {
        RouterConfig {
            nodes: names.iter().map(|name| node(name)).collect(),
            ..Default::default()
        }
    }

    fn scripted() -> Arc<ScriptedConnector> {
        Arc::new(
            ScriptedConnector::new()
                .with_backend("fs", &["read"])
                .with_backend("web", &["search"])
                .with_backend("git", &["log"])
                .failing("broken"),
        )
    }

    async fn next_frame(outlet: &mut UnboundedReceiver<String>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), outlet.recv())
            .await
            .expect("frame should arrive")
            .expect("outlet should stay open");
        serde_json::from_str(frame.trim_end()).expect("frame should be json")
    }

    #[tokio::test]
    async fn import_config_isolates_failing_backends() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&["fs", "broken", "web"]))
            .await
            .expect("import should succeed");

        let statuses: Vec<(String, String)> = router
            .composer()
            .list_target_clients()
            .into_iter()
            .map(|s| (s.name, s.status.to_string()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("fs".to_string(), "connected".to_string()),
                ("broken".to_string(), "error".to_string()),
                ("web".to_string(), "connected".to_string()),
            ]
        );
        assert_eq!(router.state(), RouterState::Configured);
    }

    #[tokio::test]
    async fn sessions_get_fresh_configured_servers() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&["fs"]))
            .await
            .expect("import should succeed");

        let first = router.open_session().await.expect("session should open");
        let second = router.open_session().await.expect("session should open");
        assert_ne!(first.id, second.id);

        let first_server = router.session_server(&first.id).expect("first session");
        let second_server = router.session_server(&second.id).expect("second session");
        assert!(!Arc::ptr_eq(first_server.composer(), second_server.composer()));
        assert!(!Arc::ptr_eq(first_server.composer(), &router.composer()));
        assert_eq!(
            first_server.catalog_at_connect(),
            Some(vec!["read".to_string()])
        );
        assert_eq!(connector.connect_count("fs"), 3);
        router.close().await;
    }

    #[tokio::test]
    async fn session_speaks_newline_json_through_post_and_outlet() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&["fs", "web"]))
            .await
            .expect("import should succeed");
        let mut session = router.open_session().await.expect("session should open");

        let initialize = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "0.0.1" }
            }
        });
        router
            .post_to_session(&session.id, &initialize.to_string())
            .expect("initialize should be accepted");
        let response = next_frame(&mut session.outlet).await;
        assert_eq!(response["id"], json!(1));
        assert!(response["result"]["capabilities"]["tools"].is_object());

        let batch = format!(
            "{}\n{}\n",
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {} })
        );
        let report = router
            .post_to_session(&session.id, &batch)
            .expect("batch should be accepted");
        assert_eq!(report.accepted, 2);

        let listed = next_frame(&mut session.outlet).await;
        assert_eq!(listed["id"], json!(2));
        let names: BTreeSet<String> = listed["result"]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .filter_map(|tool| tool["name"].as_str().map(str::to_string))
            .collect();
        assert_eq!(names, BTreeSet::from(["read".to_string(), "search".to_string()]));
        router.close().await;
    }

    #[tokio::test]
    async fn closed_session_is_removed_once_and_becomes_not_found() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&["fs"]))
            .await
            .expect("import should succeed");
        let session = router.open_session().await.expect("session should open");
        let id = session.id.clone();
        let server = router.session_server(&id).expect("session registered");

        router
            .post_to_session(&id, "")
            .expect("posting to an open session should succeed");

        drop(session);
        tokio::time::timeout(Duration::from_secs(2), server.stopped())
            .await
            .expect("session server should stop");
        for _ in 0..50 {
            if router.session_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(router.session_ids().is_empty());
        let err = router
            .post_to_session(&id, "{}")
            .expect_err("closed session should be gone");
        assert!(err.is_not_found());
        assert!(!router.close_session(&id));
    }

    #[tokio::test]
    async fn unknown_session_post_changes_nothing() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&[]))
            .await
            .expect("import should succeed");
        let session = router.open_session().await.expect("session should open");

        let err = router
            .post_to_session("missing", "{}")
            .expect_err("unknown session should fail");
        assert!(err.is_not_found());
        assert_eq!(router.session_ids(), vec![session.id.clone()]);
        router.close().await;
    }

    #[tokio::test]
    async fn update_config_prunes_and_adds_without_touching_survivors() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&RouterConfig {
                nodes: vec![node("fs"), node("web")],
                tool_chains: vec![serde_json::from_value::<ToolChainSpec>(json!({
                    "name": "lookup",
                    "steps": [{ "tool": "search" }]
                }))
                .expect("chain should parse")],
                ..Default::default()
            })
            .await
            .expect("import should succeed");

        router
            .update_config(&[node("fs"), node("git")], UpdateOptions::default())
            .await
            .expect("update should succeed");

        let composer = router.composer();
        assert_eq!(
            composer.target_names(),
            BTreeSet::from(["fs".to_string(), "git".to_string()])
        );
        assert_eq!(connector.connect_count("fs"), 1);
        assert_eq!(connector.close_count("web"), 1);
        let names: BTreeSet<String> = composer.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            BTreeSet::from(["log".to_string(), "lookup".to_string(), "read".to_string()])
        );
    }

    #[tokio::test]
    async fn stdio_mode_rejects_sessions_and_unconfigured_serving() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stdio);
        assert!(router.open_session().await.is_err());

        let (server_io, _client_io) = tokio::io::duplex(1024);
        let err = router
            .serve_default(tokio::io::split(server_io))
            .expect_err("serving before import should fail");
        assert!(matches!(err, HubError::InvalidState(_)));
        assert!(!router.default_server().is_connected());
    }

    #[tokio::test]
    async fn default_server_reflects_hot_updates_to_a_connected_client() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stdio);
        router
            .import_config(&config(&["fs"]))
            .await
            .expect("import should succeed");

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        router
            .serve_default(tokio::io::split(server_io))
            .expect("default server should connect");
        assert_eq!(
            router.default_server().catalog_at_connect(),
            Some(vec!["read".to_string()])
        );
        let client = ClientInfo::default()
            .serve(tokio::io::split(client_io))
            .await
            .expect("client handshake should succeed");

        router
            .update_config(&[node("fs"), node("web")], UpdateOptions::default())
            .await
            .expect("update should succeed");
        let names: BTreeSet<String> = client
            .list_all_tools()
            .await
            .expect("tools/list should succeed")
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        assert_eq!(names, BTreeSet::from(["read".to_string(), "search".to_string()]));

        let _ = client.cancel().await;
        router.close().await;
    }

    #[tokio::test]
    async fn close_clears_everything_and_rejects_further_use() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&config(&["fs"]))
            .await
            .expect("import should succeed");
        let _first = router.open_session().await.expect("session should open");
        let _second = router.open_session().await.expect("session should open");

        router.close().await;
        router.close().await;

        assert_eq!(router.state(), RouterState::Closed);
        assert!(router.session_ids().is_empty());
        assert!(router.open_session().await.is_err());
        assert!(router.outbound_connections().is_empty());
        assert_eq!(connector.close_count("fs"), 3);
    }

    #[tokio::test]
    async fn removing_a_chain_restores_the_backend_tool_it_shadowed() {
        let connector = Arc::new(ScriptedConnector::new().with_backend("fs", &["a", "b"]));
        let router = router_with(&connector, TransportMode::Stream);
        router
            .import_config(&RouterConfig {
                nodes: vec![node("fs")],
                tool_chains: vec![crate::mcp::test_support::chain("b", &["a"])],
                ..Default::default()
            })
            .await
            .expect("import should succeed");

        router
            .update_config(
                &[node("fs")],
                UpdateOptions {
                    tool_chains: Some(vec![]),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed");

        let composer = router.composer();
        let names: BTreeSet<String> = composer.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, BTreeSet::from(["a".to_string(), "b".to_string()]));
        let result = composer
            .call_tool("b", None)
            .await
            .expect("b should reach the backend");
        let structured = result.structured_content.expect("scripted result is structured");
        assert_eq!(structured["tool"], "b");
        assert_eq!(connector.connect_count("fs"), 1);
    }

    #[tokio::test]
    async fn close_during_open_session_leaves_no_session_behind() {
        let connector = Arc::new(
            ScriptedConnector::new()
                .with_backend("fs", &["read"])
                .with_connect_delay(Duration::from_millis(200)),
        );
        let router = Arc::new(router_with(&connector, TransportMode::Stream));
        router
            .import_config(&config(&["fs"]))
            .await
            .expect("import should succeed");

        let opening = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.open_session().await.map(|session| session.id) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        router.close().await;

        let opened = opening.await.expect("open task should not panic");
        let err = opened.expect_err("a session opened across close is rejected");
        assert!(matches!(err, HubError::InvalidState(_)));
        assert_eq!(router.state(), RouterState::Closed);
        assert!(router.session_ids().is_empty());
        assert_eq!(connector.connect_count("fs"), 2);
        assert_eq!(connector.close_count("fs"), 2);
    }

    #[tokio::test]
    async fn outbound_address_must_be_a_websocket_url() {
        let connector = scripted();
        let router = router_with(&connector, TransportMode::Stream);
        let err = router
            .connect_outbound("http://control.test")
            .await
            .expect_err("http address should be rejected");
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }
}
