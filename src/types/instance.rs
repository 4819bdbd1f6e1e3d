//! Persisted instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{NodeSpec, ToolChainSpec};
use crate::error::{HubError, Result};

/// Lifecycle status of an instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Running,
    Error,
    Restarting,
}

/// One logical gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_address: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub tool_chains: Vec<ToolChainSpec>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstance {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub access_address: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub tool_chains: Vec<ToolChainSpec>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Partial update; `None` leaves the stored field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<InstanceStatus>,
    pub access_address: Option<String>,
    pub nodes: Option<Vec<NodeSpec>>,
    pub tool_chains: Option<Vec<ToolChainSpec>>,
    pub tools: Option<Vec<String>>,
    pub namespace: Option<String>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn nodes(nodes: Vec<NodeSpec>) -> Self {
        Self {
            nodes: Some(nodes),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(HubError::InvalidArgument(
                    "instance name must not be empty".into(),
                ));
            }
        }
        validate_nodes(self.nodes.as_deref().unwrap_or_default())?;
        for chain in self.tool_chains.as_deref().unwrap_or_default() {
            chain.validate()?;
        }
        Ok(())
    }
}

impl NewInstance {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "instance name must not be empty".into(),
            ));
        }
        validate_nodes(&self.nodes)?;
        for chain in &self.tool_chains {
            chain.validate()?;
        }
        Ok(())
    }
}

impl Instance {
    /// Build a fresh record with a generated id and `stopped` status.
    pub fn create(new: NewInstance, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            description: new.description,
            status: InstanceStatus::Stopped,
            access_address: new.access_address,
            nodes: new.nodes,
            tool_chains: new.tool_chains,
            tools: new.tools,
            namespace: new.namespace,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this record and bump `updated_at`.
    pub fn apply(&mut self, patch: InstancePatch, now: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(access_address) = patch.access_address {
            self.access_address = Some(access_address).filter(|a| !a.trim().is_empty());
        }
        if let Some(nodes) = patch.nodes {
            self.nodes = nodes;
        }
        if let Some(tool_chains) = patch.tool_chains {
            self.tool_chains = tool_chains;
        }
        if let Some(tools) = patch.tools {
            self.tools = tools;
        }
        if let Some(namespace) = patch.namespace {
            self.namespace = Some(namespace);
        }
        self.updated_at = now;
    }

    /// Outbound registration target, if the access address is a websocket URL.
    pub fn outbound_address(&self) -> Option<&str> {
        self.access_address
            .as_deref()
            .map(str::trim)
            .filter(|address| address.starts_with("ws://") || address.starts_with("wss://"))
    }
}

fn validate_nodes(nodes: &[NodeSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for node in nodes {
        node.validate()?;
        if !seen.insert(node.id.as_str()) {
            return Err(HubError::InvalidArgument(format!(
                "duplicate node id {}",
                node.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Instance {
        Instance::create(
            NewInstance {
                name: " docs ".into(),
                nodes: vec![NodeSpec::stdio("n1", "uvx", vec!["mcp-server-fetch".into()])],
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn create_trims_name_and_starts_stopped() {
        let instance = sample();
        assert_eq!(instance.name, "docs");
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert_eq!(instance.created_at, instance.updated_at);
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut instance = sample();
        let later = instance.updated_at + chrono::Duration::seconds(5);
        instance.apply(InstancePatch::status(InstanceStatus::Running), later);

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.nodes.len(), 1);
        assert_eq!(instance.updated_at, later);
    }

    #[test]
    fn outbound_address_requires_websocket_scheme() {
        let mut instance = sample();
        instance.access_address = Some("https://control.example.com".into());
        assert_eq!(instance.outbound_address(), None);

        instance.access_address = Some("wss://control.example.com/register".into());
        assert_eq!(
            instance.outbound_address(),
            Some("wss://control.example.com/register")
        );
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let new = NewInstance {
            name: "dup".into(),
            nodes: vec![
                NodeSpec::stdio("n1", "a", Vec::new()),
                NodeSpec::stdio("n1", "b", Vec::new()),
            ],
            ..Default::default()
        };
        assert!(matches!(
            new.validate(),
            Err(HubError::InvalidArgument(message)) if message.contains("duplicate")
        ));
    }

    #[test]
    fn status_parses_from_lowercase() {
        let status: InstanceStatus = "restarting".parse().expect("status should parse");
        assert_eq!(status, InstanceStatus::Restarting);
        assert_eq!(InstanceStatus::Error.to_string(), "error");
    }
}
