//! Coordinator access
//!
//! Thin gateway over the hierarchical, watchable metadata namespace the
//! fleet coordinates through, plus the in-process implementation used by
//! tests and single-node deployments.

pub mod gateway;
pub mod memory;

pub use gateway::{ensure_node, CoordinatorGateway, CoordinatorLock, CreateMode, NodeEvent, WatchRx};
pub use memory::{CoordinatorSpace, MemoryCoordinator};
