//! Backend node declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{HubError, Result};

/// One declared backend endpoint inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub endpoint: NodeEndpoint,
}

/// How a backend is reached. Exactly one connection shape per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeEndpoint {
    /// Remote server over the streamable HTTP transport.
    #[serde(alias = "sse")]
    Stream { url: String },
    /// Local subprocess speaking line-delimited JSON over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    Stream,
    Stdio,
}

impl NodeEndpoint {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Stream { .. } => NodeKind::Stream,
            Self::Stdio { .. } => NodeKind::Stdio,
        }
    }
}

impl NodeSpec {
    pub fn stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            endpoint: NodeEndpoint::Stream { url: url.into() },
        }
    }

    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            endpoint: NodeEndpoint::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Check kind-specific required fields. Called where records enter the store.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HubError::InvalidArgument("node id must not be empty".into()));
        }
        match &self.endpoint {
            NodeEndpoint::Stream { url } => {
                let url = url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(HubError::InvalidArgument(format!(
                        "node {}: stream url must be http(s), got {url:?}",
                        self.id
                    )));
                }
            }
            NodeEndpoint::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(HubError::InvalidArgument(format!(
                        "node {}: stdio command must not be empty",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}
