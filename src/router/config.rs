//! Router configuration and its parsed, applied form.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::mcp::TargetSpec;
use crate::naming::normalize_namespace;
use crate::types::{Instance, NodeSpec, ToolChainSpec};

/// Raw configuration handed to [`super::Router::import_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub tool_chains: Vec<ToolChainSpec>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl RouterConfig {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            nodes: instance.nodes.clone(),
            tool_chains: instance.tool_chains.clone(),
            tools: instance.tools.clone(),
            namespace: instance.namespace.clone(),
        }
    }
}

/// Optional fields of a hot update; `None` keeps the previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub tool_chains: Option<Vec<ToolChainSpec>>,
    pub tools: Option<Vec<String>>,
    pub namespace: Option<String>,
}

impl UpdateOptions {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            tool_chains: Some(instance.tool_chains.clone()),
            tools: Some(instance.tools.clone()),
            namespace: instance.namespace.clone(),
        }
    }
}

/// Configuration resolved to derived backend names, ready to apply to a composer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    pub targets: Vec<TargetSpec>,
    pub tool_chains: Vec<ToolChainSpec>,
    pub tools_filter: Vec<String>,
    pub namespace: String,
}

impl ParsedConfig {
    pub fn parse(config: &RouterConfig) -> Self {
        Self {
            targets: resolve_targets(&config.nodes),
            tool_chains: config.tool_chains.clone(),
            tools_filter: config.tools.clone(),
            namespace: normalize_namespace(config.namespace.as_deref()),
        }
    }

    /// Recompute for new nodes, carrying over options the update leaves unset.
    pub fn merged(previous: Option<&ParsedConfig>, nodes: &[NodeSpec], options: UpdateOptions) -> Self {
        let namespace = match (options.namespace, previous) {
            (Some(namespace), _) => normalize_namespace(Some(&namespace)),
            (None, Some(previous)) => previous.namespace.clone(),
            (None, None) => normalize_namespace(None),
        };
        Self {
            targets: resolve_targets(nodes),
            tool_chains: options
                .tool_chains
                .or_else(|| previous.map(|p| p.tool_chains.clone()))
                .unwrap_or_default(),
            tools_filter: options
                .tools
                .or_else(|| previous.map(|p| p.tools_filter.clone()))
                .unwrap_or_default(),
            namespace,
        }
    }

    pub fn target_names(&self) -> BTreeSet<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    pub fn chain_names(&self) -> BTreeSet<String> {
        self.tool_chains.iter().map(|c| c.name.clone()).collect()
    }
}

/// One target per derived name. A later node with the same name replaces the
/// earlier one but keeps its position.
fn resolve_targets(nodes: &[NodeSpec]) -> Vec<TargetSpec> {
    let mut targets: Vec<TargetSpec> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let target = TargetSpec::from_node(node);
        match targets.iter_mut().find(|t| t.name == target.name) {
            Some(existing) => {
                tracing::warn!(
                    backend = %target.name,
                    node_id = %node.id,
                    "duplicate derived node name, last definition wins"
                );
                *existing = target;
            }
            None => targets.push(target),
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeEndpoint;
    use pretty_assertions::assert_eq;

    fn config(nodes: Vec<NodeSpec>) -> RouterConfig {
        RouterConfig {
            nodes,
            ..Default::default()
        }
    }

    #[test]
    fn parse_resolves_names_and_defaults_namespace() {
        let parsed = ParsedConfig::parse(&RouterConfig {
            nodes: vec![
                NodeSpec::stdio("1", "npx", vec!["-y".into(), "@acme/files@1.2".into()]),
                NodeSpec::stream("2", "https://search.test/mcp").with_name("web"),
            ],
            namespace: Some("bad namespace!".into()),
            ..Default::default()
        });

        let names: Vec<&str> = parsed.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["acme-files", "web"]);
        assert_eq!(parsed.namespace, ".");
    }

    #[test]
    fn duplicate_names_keep_first_position_and_last_definition() {
        let parsed = ParsedConfig::parse(&config(vec![
            NodeSpec::stdio("1", "/bin/a", vec![]).with_name("dup"),
            NodeSpec::stdio("2", "/bin/b", vec![]).with_name("other"),
            NodeSpec::stdio("3", "/bin/c", vec![]).with_name("dup"),
        ]));

        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.targets[0].name, "dup");
        assert!(matches!(
            &parsed.targets[0].endpoint,
            NodeEndpoint::Stdio { command, .. } if command == "/bin/c"
        ));
    }

    #[test]
    fn merged_keeps_unspecified_options() {
        let previous = ParsedConfig::parse(&RouterConfig {
            nodes: vec![],
            tool_chains: vec![],
            tools: vec!["a".into()],
            namespace: Some("team".into()),
        });

        let merged = ParsedConfig::merged(
            Some(&previous),
            &[NodeSpec::stdio("1", "/usr/local/bin/search.sh", vec![])],
            UpdateOptions::default(),
        );
        assert_eq!(merged.tools_filter, vec!["a".to_string()]);
        assert_eq!(merged.namespace, "team");
        assert_eq!(merged.target_names(), BTreeSet::from(["search".to_string()]));

        let replaced = ParsedConfig::merged(
            Some(&previous),
            &[],
            UpdateOptions {
                tools: Some(vec![]),
                namespace: Some("other".into()),
                ..Default::default()
            },
        );
        assert!(replaced.tools_filter.is_empty());
        assert_eq!(replaced.namespace, "other");
    }
}
