//! Per-shard published state (spec.md §5 "Scheduling model").
//!
//! Each shard is modeled as the sole owner of one cell holding the
//! currently-published `TokenMetadata` plus its derived per-keyspace
//! replica maps. Publication is a fan-out message (a `watch` send), never a
//! shared-memory mutation — the teacher's per-node `Rc<RefCell<Backend>>`
//! ownership (`ec_node.rs`) generalizes here to one `watch` channel per
//! shard, since real cross-shard isolation requires the publish step to
//! cross an explicit boundary rather than share a `Rc`. `Shard` holds both
//! the sender and its own receiver, so readers call `current()` without a
//! running task per shard; a transport that puts each shard behind its own
//! `tokio::task` would hand the receiver half to that task instead and keep
//! the sender here, but that split has no counterpart in this crate's
//! single-process scope.

use crate::token_metadata::{PendingRanges, TokenMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A keyspace's range ownership as seen by one shard after a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaMap {
    pub pending: PendingRanges,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub token_metadata: Arc<TokenMetadata>,
    pub replica_maps: Arc<HashMap<String, ReplicaMap>>,
}

impl Published {
    fn empty() -> Self {
        Self { token_metadata: Arc::new(TokenMetadata::new()), replica_maps: Arc::new(HashMap::new()) }
    }
}

/// One shard's publish endpoint. Readers call `borrow()`/`current()`;
/// only the replicator (C6) ever calls `publish`.
pub struct Shard {
    tx: watch::Sender<Published>,
    rx: watch::Receiver<Published>,
}

impl Shard {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(Published::empty());
        Self { tx, rx }
    }

    pub fn current(&self) -> Published {
        self.rx.borrow().clone()
    }

    /// Swap in a new snapshot (spec.md §4.6 step 5). `Shard` keeps its own
    /// receiver alongside the sender, so this can never observe "no
    /// receivers left" — the failure case `watch::Sender::send` defines
    /// does not arise under this ownership.
    pub fn publish(&self, published: Published) {
        let _ = self.tx.send(published);
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}
