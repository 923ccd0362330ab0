//! Topology data model, addressing, allocation and storage

pub mod address;
pub mod allocator;
pub mod graph;
pub mod model;
pub mod store;

pub use address::{AddressError, AddressSpace, InterfaceAddress, Subnet};
pub use allocator::{next_link_id, next_node_name, next_subnet_id, AllocationError};
pub use graph::{Edge, TopologyGraph};
pub use model::{link_pair, HalfLink, ModelError, NodeKind, TopologyList, TopologyRecord};
pub use store::{
    load_graph, update_links, AllocationLocks, MemoryTopologyStore, StoreError, TopologyStore,
};
