// src/core/cluster/mod.rs

//! Cluster connectivity: the wire protocol, the transport seam, and the
//! in-process mesh implementation.

pub mod bus;
pub mod memory;
pub mod messages;

pub use bus::{ClusterBus, MemberEvent, NodeLink};
pub use memory::MemoryBus;
pub use messages::{NodeId, PROTOCOL_VERSION};
