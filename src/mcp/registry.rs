//! Tool catalog keyed by exposed name.
//!
//! Enabled state is never toggled ad hoc: it is recomputed from the active
//! [`ToolFilter`] whenever an entry is registered or the filter changes.

use std::collections::{BTreeMap, BTreeSet};

use rmcp::model::Tool;
use serde::Serialize;

/// Where calls to an exposed tool are routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolOrigin {
    Backend { backend: String, native: String },
    Chain,
}

#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub descriptor: Tool,
    pub enabled: bool,
    pub origin: ToolOrigin,
}

impl ToolEntry {
    pub fn chain_owned(&self) -> bool {
        matches!(self.origin, ToolOrigin::Chain)
    }

    pub fn backend(&self) -> Option<&str> {
        match &self.origin {
            ToolOrigin::Backend { backend, .. } => Some(backend),
            ToolOrigin::Chain => None,
        }
    }
}

/// Allow-list plus the chain names that override it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFilter {
    allow: BTreeSet<String>,
    chains: BTreeSet<String>,
}

impl ToolFilter {
    pub fn new(
        allow: impl IntoIterator<Item = String>,
        chains: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            allow: allow.into_iter().filter(|n| !n.trim().is_empty()).collect(),
            chains: chains.into_iter().collect(),
        }
    }

    /// An empty allow-list enables everything; chain names are always enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(name) || self.chains.contains(name)
    }
}

/// Result of trying to register a backend tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added,
    Replaced,
    /// Name already owned by a chain or another backend.
    Conflict { owner: ToolOrigin },
}

#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
    filter: ToolFilter,
}

impl ToolRegistry {
    pub fn register_backend_tool(
        &mut self,
        exposed: String,
        backend: &str,
        native: &str,
        mut descriptor: Tool,
    ) -> Registration {
        let outcome = match self.entries.get(&exposed) {
            Some(existing) if existing.backend() == Some(backend) => Registration::Replaced,
            Some(existing) => {
                return Registration::Conflict {
                    owner: existing.origin.clone(),
                }
            }
            None => Registration::Added,
        };

        descriptor.name = exposed.clone().into();
        let enabled = self.filter.is_enabled(&exposed);
        self.entries.insert(
            exposed,
            ToolEntry {
                descriptor,
                enabled,
                origin: ToolOrigin::Backend {
                    backend: backend.to_string(),
                    native: native.to_string(),
                },
            },
        );
        outcome
    }

    /// Register a chain, displacing any backend tool of the same name.
    pub fn register_chain(&mut self, mut descriptor: Tool) -> Option<ToolEntry> {
        let name = descriptor.name.to_string();
        descriptor.name = name.clone().into();
        let enabled = self.filter.is_enabled(&name);
        self.entries.insert(
            name,
            ToolEntry {
                descriptor,
                enabled,
                origin: ToolOrigin::Chain,
            },
        )
        .filter(|previous| !previous.chain_owned())
    }

    /// Drop chains whose names are not in `keep`.
    pub fn retain_chains(&mut self, keep: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|name, entry| !entry.chain_owned() || keep.contains(name));
        before - self.entries.len()
    }

    /// Remove every tool contributed by `backend`.
    pub fn remove_backend(&mut self, backend: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.backend() != Some(backend));
        before - self.entries.len()
    }

    /// Replace the filter and recompute every entry's enabled state.
    pub fn set_filter(&mut self, filter: ToolFilter) {
        for (name, entry) in self.entries.iter_mut() {
            entry.enabled = filter.is_enabled(name);
        }
        self.filter = filter;
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolEntry)> {
        self.entries.iter()
    }

    pub fn enabled_descriptors(&self) -> Vec<Tool> {
        self.entries
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn count_for_backend(&self, backend: &str) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.backend() == Some(backend))
            .count()
    }

    pub fn chain_names(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.chain_owned())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
