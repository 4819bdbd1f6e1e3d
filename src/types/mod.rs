//! Core data types for mcp-hub.

pub mod chain;
pub mod instance;
pub mod node;

pub use chain::*;
pub use instance::*;
pub use node::*;
