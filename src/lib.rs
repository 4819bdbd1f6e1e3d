//! mcp-hub: multi-tenant MCP gateway
//!
//! Each instance aggregates a set of backend MCP servers (stdio subprocesses or
//! streamable HTTP endpoints) behind one namespaced virtual server. Consumers
//! reach an instance over SSE sessions or standard I/O, and the gateway can
//! also keep an outbound websocket registration alive on its behalf.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_hub::instance::{InstanceManager, MemoryInstanceStore};
//! use mcp_hub::types::{NewInstance, NodeSpec};
//!
//! # async fn example() -> mcp_hub::error::Result<()> {
//! let manager = InstanceManager::new(Arc::new(MemoryInstanceStore::new()));
//! let instance = manager
//!     .create_instance(NewInstance {
//!         name: "files".into(),
//!         nodes: vec![NodeSpec::stdio("fs", "mcp-server-filesystem", vec!["/srv".into()])],
//!         ..Default::default()
//!     })
//!     .await?;
//! manager.start_instance(&instance.id).await?;
//! for tool in manager.list_tools(&instance.id).await? {
//!     println!("{} enabled={}", tool.name, tool.enabled);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod mcp;
pub mod naming;
pub mod router;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{HubError, Result};
pub use instance::InstanceManager;
pub use router::{Router, RouterOptions, TransportMode};
