//! Crate-wide error taxonomy (spec.md §7).

use crate::types::Endpoint;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Startup condition that must abort the process: decommissioned
    /// without operator override, replace of a live node, replace with no
    /// seeds, missing replacement info, empty ring after NORMAL.
    #[error("fatal startup condition: {0}")]
    Fatal(String),

    /// A transient cluster-state condition that was retried until its
    /// bound elapsed: other bootstrappers visible, schema not agreed, no
    /// normal token owners, pending operations on peers.
    #[error("{reason} did not clear after {elapsed:?}")]
    Transient { reason: String, elapsed: Duration },

    /// A peer did not answer within the messaging layer's deadline.
    #[error("peer {0} unreachable")]
    PeerUnreachable(Endpoint),

    /// A peer responded that it does not understand the verb sent to it
    /// (too old a version).
    #[error("peer {0} does not support this operation, please upgrade")]
    UnknownVerb(Endpoint),

    /// Per-shard replication failed before publish; the old snapshot is
    /// still authoritative.
    #[error("replication to all shards failed, snapshot unchanged: {0}")]
    ReplicationFailed(String),

    /// A shard failed to accept a snapshot *after* the publish decision was
    /// made. Per spec.md §4.6 step 5, this is unrecoverable.
    #[error("shard failed to publish an already-committed snapshot: {0}")]
    Unrecoverable(String),

    /// The operation's `abort_source` was signaled (operator abort,
    /// shutdown, or watchdog expiry).
    #[error("operation aborted")]
    Aborted,

    /// A node-ops peer already has an in-flight operation and rejected a
    /// `*_prepare`.
    #[error("peer {0} already has an in-flight operation {1}")]
    OperationInProgress(Endpoint, uuid::Uuid),

    /// A non-prepare node-ops command referenced an `ops_uuid` the peer
    /// does not have registered.
    #[error("peer {0} has no in-flight operation {1}")]
    UnknownOperation(Endpoint, uuid::Uuid),
}

impl CoordinatorError {
    /// Whether the caller (join sequencer, `main`) should abort the process
    /// rather than propagate and retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Unrecoverable(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
