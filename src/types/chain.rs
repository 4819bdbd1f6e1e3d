//! Tool-chain declarations.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{HubError, Result};

/// A synthetic tool defined as a sequence of other tool invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChainSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub output: ChainOutput,
}

/// One invocation inside a chain.
///
/// String argument values are templates: `$input.<key>` takes the caller's argument,
/// `$prev` the previous step's result and `$steps.<n>` the result of step `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Which step results make up the chain's result.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainOutput {
    #[default]
    Last,
    All,
}

impl ToolChainSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "tool chain name must not be empty".into(),
            ));
        }
        if self.steps.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "tool chain {} has no steps",
                self.name
            )));
        }
        if let Some(step) = self.steps.iter().find(|step| step.tool.trim().is_empty()) {
            return Err(HubError::InvalidArgument(format!(
                "tool chain {} has a step without a tool name ({step:?})",
                self.name
            )));
        }
        Ok(())
    }
}
