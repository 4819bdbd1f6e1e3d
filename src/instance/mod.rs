//! Instance persistence and the manager that turns records into routers.

pub mod manager;
pub mod store;

pub use manager::{InstanceManager, NodeState, NodeStatusView};
pub use store::{FileInstanceStore, InstanceStore, MemoryInstanceStore};
