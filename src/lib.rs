//! # membership-coordinator
//!
//! Cluster membership and topology-change coordination for a
//! distributed, token-partitioned storage node: gossip-driven peer
//! lifecycle, token ring ownership, and the bootstrap / replace /
//! decommission / removenode protocols that move tokens between nodes.
//!
//! ## Core components
//!
//! - **`token_metadata`**: the authoritative token ring and pending-range
//!   overlay (C1).
//! - **`mode`**: the node's own lifecycle mode state machine (C2).
//! - **`gossip_handler`**: translates peer gossip state changes into
//!   token-metadata mutations (C3).
//! - **`join`**: the startup pipeline a node runs once to join the ring
//!   (C4).
//! - **`node_ops`**: the coordinator/peer protocol engine for
//!   bootstrap/replace/decommission/removenode (C5).
//! - **`replicator`**: fans a new token-metadata snapshot out to every
//!   execution shard (C6).
//! - **`notifier`**: join/up/down/left event fan-out to subscribers (C7).
//!
//! ## Usage with a real cluster
//!
//! This crate is transport-agnostic: the gossip bus, RPC messaging,
//! streaming engine, Raft group, and local database are all traits
//! (`collaborators`). A real deployment implements those traits against
//! its actual gossip/RPC stack; tests drive the in-memory fakes in
//! `collaborators::fakes`.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gossip_handler;
pub mod join;
pub mod metrics;
pub mod mode;
pub mod node_ops;
pub mod notifier;
pub mod replicator;
pub mod shard;
pub mod token_metadata;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{CoordinatorError, Result};
pub use gossip_handler::GossipHandler;
pub use join::JoinSequencer;
pub use mode::{Mode, ModeState};
pub use node_ops::{NodeOpsCoordinator, NodeOpsRegistry};
pub use replicator::MetadataReplicator;
