//! Metadata Replicator (C6, spec.md §4.6).
//!
//! `replicate_to_all_cores`: clone a new `TokenMetadata` snapshot to every
//! shard, precompute per-keyspace replica maps, and swap all shards
//! atomically. On any precompute failure the pending snapshots are
//! discarded and the published state is untouched (spec.md §4.6 steps 4-5).

use crate::collaborators::LocalDatabase;
use crate::error::{CoordinatorError, Result};
use crate::shard::{Published, ReplicaMap, Shard};
use crate::token_metadata::TokenMetadata;
use crate::types::Endpoint;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Unified with the schema-merge lock per spec.md §4.6: callers already
/// holding that lock pass `AcquireMergeLock::No`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMergeLock {
    Yes,
    No,
}

pub struct MetadataReplicator {
    shards: Vec<Shard>,
    /// Token-metadata lock, unified with the schema-merge lock (spec.md
    /// §4.6). `tokio::sync::Mutex` so holders can await across suspension
    /// points (shard fan-out, cooperative clone yields).
    lock: Mutex<()>,
}

impl MetadataReplicator {
    pub fn new(shard_count: usize) -> Self {
        Self { shards: (0..shard_count.max(1)).map(|_| Shard::new()).collect(), lock: Mutex::new(()) }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    /// The snapshot currently published on shard 0, used by callers that
    /// just need to read the authoritative state rather than mutate it.
    pub fn current(&self) -> Published {
        self.shards[0].current()
    }

    /// `replicate_to_all_cores(new_tm)` (spec.md §4.6). Shard-0-only by
    /// convention of the caller (the join sequencer, gossip handler, and
    /// node-ops coordinator all run on shard 0 per spec.md §3 "Ownership").
    pub async fn replicate_to_all_cores(
        &self,
        new_tm: TokenMetadata,
        local_db: &dyn LocalDatabase,
        acquire: AcquireMergeLock,
    ) -> Result<()> {
        let _guard = match acquire {
            AcquireMergeLock::Yes => Some(self.lock.lock().await),
            AcquireMergeLock::No => None,
        };

        let new_ring_version = new_tm.ring_version;
        let mut pending = Vec::with_capacity(self.shards.len());

        for _ in &self.shards {
            let clone = new_tm.clone_async().await;
            let replica_maps = match build_replica_maps(&clone, local_db) {
                Ok(maps) => maps,
                Err(e) => {
                    // Step 4: clear pending snapshots on failure, rethrow.
                    // `pending` simply goes out of scope; nothing was
                    // published yet.
                    return Err(CoordinatorError::ReplicationFailed(e));
                }
            };
            pending.push(Published { token_metadata: Arc::new(clone), replica_maps: Arc::new(replica_maps) });
        }

        // Step 5: swap all shards atomically.
        for (shard, published) in self.shards.iter().zip(pending) {
            shard.publish(published);
        }

        info!("replicated ring_version={new_ring_version} to {} shard(s)", self.shards.len());
        Ok(())
    }
}

fn build_replica_maps(tm: &TokenMetadata, local_db: &dyn LocalDatabase) -> std::result::Result<HashMap<String, ReplicaMap>, String> {
    let mut maps = HashMap::new();
    for (keyspace, _strategy) in local_db.keyspaces() {
        let pending = tm.pending_ranges_for(&keyspace);
        maps.insert(keyspace, ReplicaMap { pending });
    }
    Ok(maps)
}

/// Recompute pending ranges for every keyspace against `this_endpoint`,
/// then publish. This is the common path used by the gossip handler (C3)
/// and join sequencer (C4): mutate a working copy, recompute, replicate.
pub async fn recompute_and_replicate(
    replicator: &MetadataReplicator,
    mut tm: TokenMetadata,
    local_db: &dyn LocalDatabase,
    this_endpoint: Endpoint,
) -> Result<()> {
    for (keyspace, strategy) in local_db.keyspaces() {
        tm.update_pending_ranges(&keyspace, strategy, this_endpoint);
    }
    replicator.replicate_to_all_cores(tm, local_db, AcquireMergeLock::Yes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeLocalDatabase;
    use crate::types::Token;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn ep(n: u8) -> Endpoint {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7000)
    }

    #[tokio::test]
    async fn successful_replication_is_visible_on_every_shard() {
        let replicator = MetadataReplicator::new(3);
        let db = FakeLocalDatabase::new(1);
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(1)], ep(1), crate::types::GossipClock { generation: 1, version: 1 });
        let version = tm.ring_version;

        replicator.replicate_to_all_cores(tm, &db, AcquireMergeLock::Yes).await.unwrap();

        for i in 0..3 {
            assert_eq!(replicator.shard(i).current().token_metadata.ring_version, version);
        }
    }

    #[tokio::test]
    async fn recompute_and_replicate_populates_pending_ranges_per_keyspace() {
        let replicator = MetadataReplicator::new(1);
        let db = FakeLocalDatabase::new(1);
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(10)], ep(1), crate::types::GossipClock { generation: 1, version: 1 });
        tm.add_bootstrap_tokens(&[Token(20)], ep(2));

        recompute_and_replicate(&replicator, tm, &db, ep(2)).await.unwrap();

        let published = replicator.current();
        assert!(published.replica_maps.contains_key("system"));
    }
}
