//! Node-Ops Coordinator (C5, spec.md §4.5).
//!
//! The distributed protocol engine for bootstrap/replace/decommission/
//! removenode: a sequence of RPC fan-outs from the operator's node to a
//! `sync_nodes` set, interleaved with a heartbeat task, with watchdog-driven
//! self-abort on every peer. The watchdog itself is modeled the way the
//! teacher models ticket rotation in `ec_ticket_manager.rs` — an explicit
//! deadline checked against a caller-supplied "now", rather than a detached
//! timer task, so the abort path is deterministic to test.

use crate::collaborators::{LocalDatabase, Messaging};
use crate::error::{CoordinatorError, Result};
use crate::replicator::{AcquireMergeLock, MetadataReplicator};
use crate::token_metadata::TokenMetadata;
use crate::types::{Endpoint, Token};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOpsKind {
    Bootstrap,
    Replace,
    Decommission,
    Removenode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOpsCmd {
    BootstrapPrepare,
    BootstrapHeartbeat,
    BootstrapDone,
    BootstrapAbort,
    ReplacePrepare,
    ReplacePrepareMarkAlive,
    ReplacePreparePendingRanges,
    ReplaceHeartbeat,
    ReplaceDone,
    ReplaceAbort,
    DecommissionPrepare,
    DecommissionHeartbeat,
    DecommissionDone,
    DecommissionAbort,
    RemovenodePrepare,
    RemovenodeHeartbeat,
    RemovenodeSyncData,
    RemovenodeDone,
    RemovenodeAbort,
    QueryPendingOps,
    RepairUpdater,
}

impl NodeOpsCmd {
    pub fn is_prepare(&self) -> bool {
        matches!(
            self,
            Self::BootstrapPrepare | Self::ReplacePrepare | Self::DecommissionPrepare | Self::RemovenodePrepare
        )
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::BootstrapAbort | Self::ReplaceAbort | Self::DecommissionAbort | Self::RemovenodeAbort)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::BootstrapDone | Self::ReplaceDone | Self::DecommissionDone | Self::RemovenodeDone)
    }

    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Self::QueryPendingOps | Self::RepairUpdater)
    }

    pub fn kind(&self) -> Option<NodeOpsKind> {
        use NodeOpsCmd::*;
        match self {
            BootstrapPrepare | BootstrapHeartbeat | BootstrapDone | BootstrapAbort => Some(NodeOpsKind::Bootstrap),
            ReplacePrepare | ReplacePrepareMarkAlive | ReplacePreparePendingRanges | ReplaceHeartbeat
            | ReplaceDone | ReplaceAbort => Some(NodeOpsKind::Replace),
            DecommissionPrepare | DecommissionHeartbeat | DecommissionDone | DecommissionAbort => {
                Some(NodeOpsKind::Decommission)
            }
            RemovenodePrepare | RemovenodeHeartbeat | RemovenodeSyncData | RemovenodeDone | RemovenodeAbort => {
                Some(NodeOpsKind::Removenode)
            }
            QueryPendingOps | RepairUpdater => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeOpsCmdRequest {
    pub cmd: NodeOpsCmd,
    pub ops_uuid: Uuid,
    pub ignore_nodes: Vec<Endpoint>,
    pub leaving_nodes: Vec<Endpoint>,
    pub replace_nodes: Vec<(Endpoint, Endpoint)>,
    pub bootstrap_nodes: Vec<Endpoint>,
    pub repair_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NodeOpsCmdResponse {
    pub ok: bool,
    pub pending_ops: Vec<Uuid>,
}

/// The undo action a watchdog expiry or explicit abort applies to local
/// metadata (spec.md §3 `abort_fn`). Modeled as data rather than a closure
/// so it can be inspected in tests and so a watchdog firing is
/// observationally identical to an explicit `*_abort` (spec.md §8
/// invariant 6).
#[derive(Debug, Clone)]
pub enum AbortAction {
    DelLeavingEndpoint(Endpoint),
    DelReplacingEndpoint(Endpoint),
    RemoveBootstrapTokens(Vec<Token>),
}

pub fn apply_abort_action(tm: &mut TokenMetadata, action: &AbortAction) {
    match action {
        AbortAction::DelLeavingEndpoint(ep) => tm.del_leaving_endpoint(*ep),
        AbortAction::DelReplacingEndpoint(ep) => tm.del_replacing_endpoint(*ep),
        AbortAction::RemoveBootstrapTokens(tokens) => tm.remove_bootstrap_tokens(tokens),
    }
}

#[derive(Debug, Clone)]
struct NodeOpsEntry {
    coordinator: Endpoint,
    kind: NodeOpsKind,
    abort_action: AbortAction,
    watchdog_deadline: Instant,
}

/// Peer-side in-flight operation set (spec.md §3 `NodeOpsMetadata`
/// lifecycle, §4.5 invariants). A small counting semaphore (capacity 1)
/// serializes add/update/done/abort transitions (spec.md §5).
pub struct NodeOpsRegistry {
    entries: Mutex<HashMap<Uuid, NodeOpsEntry>>,
    transition_lock: Semaphore,
}

impl NodeOpsRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), transition_lock: Semaphore::new(1) }
    }

    pub async fn in_flight(&self) -> Vec<Uuid> {
        self.entries.lock().await.keys().copied().collect()
    }

    /// Accepts a `*_prepare`: the peer must currently have no in-flight
    /// ops (spec.md §4.5).
    pub async fn accept_prepare(
        &self,
        ops_uuid: Uuid,
        coordinator: Endpoint,
        kind: NodeOpsKind,
        abort_action: AbortAction,
        watchdog_silence: Duration,
        now: Instant,
    ) -> Result<()> {
        let _permit = self.transition_lock.acquire().await.unwrap();
        let mut entries = self.entries.lock().await;
        if !entries.is_empty() {
            return Err(CoordinatorError::OperationInProgress(coordinator, *entries.keys().next().unwrap()));
        }
        entries.insert(
            ops_uuid,
            NodeOpsEntry { coordinator, kind, abort_action, watchdog_deadline: now + watchdog_silence },
        );
        Ok(())
    }

    /// For any non-prepare command, the peer's in-flight set must be
    /// exactly `{ops_uuid}` (spec.md §4.5).
    async fn require_exact(&self, ops_uuid: Uuid) -> Result<()> {
        let entries = self.entries.lock().await;
        if entries.len() != 1 || !entries.contains_key(&ops_uuid) {
            return Err(CoordinatorError::UnknownOperation(
                entries.values().next().map(|e| e.coordinator).unwrap_or_else(|| "0.0.0.0:0".parse().unwrap()),
                ops_uuid,
            ));
        }
        Ok(())
    }

    pub async fn heartbeat(&self, ops_uuid: Uuid, watchdog_silence: Duration, now: Instant) -> Result<()> {
        self.require_exact(ops_uuid).await?;
        let _permit = self.transition_lock.acquire().await.unwrap();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&ops_uuid) {
            entry.watchdog_deadline = now + watchdog_silence;
        }
        Ok(())
    }

    /// `*_done`: cancels the watchdog, removes the entry.
    pub async fn done(&self, ops_uuid: Uuid) -> Result<()> {
        self.require_exact(ops_uuid).await?;
        let _permit = self.transition_lock.acquire().await.unwrap();
        self.entries.lock().await.remove(&ops_uuid);
        Ok(())
    }

    /// `*_abort`: runs `abort_fn`, cancels the watchdog, removes the entry.
    pub async fn abort(&self, ops_uuid: Uuid) -> Result<AbortAction> {
        self.require_exact(ops_uuid).await?;
        let _permit = self.transition_lock.acquire().await.unwrap();
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&ops_uuid).expect("require_exact just confirmed presence");
        Ok(entry.abort_action)
    }

    /// Watchdog sweep: entries whose deadline has passed `now` self-abort,
    /// identically to an explicit `*_abort` (spec.md §8 invariant 6).
    pub async fn reap_expired(&self, now: Instant) -> Vec<(Uuid, AbortAction)> {
        let _permit = self.transition_lock.acquire().await.unwrap();
        let mut entries = self.entries.lock().await;
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.watchdog_deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::new();
        for id in expired {
            if let Some(entry) = entries.remove(&id) {
                warn!("watchdog expired for operation {id}, reverting");
                out.push((id, entry.abort_action));
            }
        }
        out
    }
}

impl Default for NodeOpsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer-side dispatcher (spec.md §4.5 `node_ops_cmd_handler`).
pub async fn node_ops_cmd_handler(
    registry: &NodeOpsRegistry,
    replicator: &MetadataReplicator,
    local_db: &dyn LocalDatabase,
    this_endpoint: Endpoint,
    watchdog_silence: Duration,
    now: Instant,
    req: NodeOpsCmdRequest,
) -> Result<NodeOpsCmdResponse> {
    if req.cmd.is_auxiliary() {
        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: registry.in_flight().await });
    }

    if req.cmd.is_prepare() {
        let kind = req.cmd.kind().expect("prepare commands always have a kind");
        let (abort_action, mutate): (AbortAction, Box<dyn FnOnce(&mut TokenMetadata) + Send>) = match kind {
            NodeOpsKind::Decommission | NodeOpsKind::Removenode => {
                let ep = *req.leaving_nodes.first().ok_or_else(|| {
                    CoordinatorError::Fatal("prepare missing leaving_nodes entry".into())
                })?;
                (AbortAction::DelLeavingEndpoint(ep), Box::new(move |tm| tm.add_leaving_endpoint(ep)))
            }
            NodeOpsKind::Replace => {
                let (existing, replacing) = *req
                    .replace_nodes
                    .first()
                    .ok_or_else(|| CoordinatorError::Fatal("prepare missing replace_nodes entry".into()))?;
                (
                    AbortAction::DelReplacingEndpoint(existing),
                    Box::new(move |tm| {
                        let _ = tm.add_replacing_endpoint(existing, replacing);
                    }),
                )
            }
            NodeOpsKind::Bootstrap => {
                let ep = *req.bootstrap_nodes.first().ok_or_else(|| {
                    CoordinatorError::Fatal("prepare missing bootstrap_nodes entry".into())
                })?;
                // Tokens for the bootstrapping peer are learned via gossip
                // separately; the prepare phase itself just reserves the
                // in-flight slot, so the undo action here is a no-op
                // removal of whatever tokens end up added (an empty set is
                // safe since `remove_bootstrap_tokens` on untracked tokens
                // is a no-op).
                (AbortAction::RemoveBootstrapTokens(vec![]), Box::new(move |_tm| { let _ = ep; }))
            }
        };

        registry
            .accept_prepare(req.ops_uuid, req.ignore_nodes.first().copied().unwrap_or(this_endpoint), kind, abort_action, watchdog_silence, now)
            .await?;

        let mut tm = (*replicator.current().token_metadata).clone();
        mutate(&mut tm);
        for (ks, strategy) in local_db.keyspaces() {
            tm.update_pending_ranges(&ks, strategy, this_endpoint);
        }
        replicator.replicate_to_all_cores(tm, local_db, AcquireMergeLock::Yes).await?;

        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: registry.in_flight().await });
    }

    if req.cmd == NodeOpsCmd::ReplacePrepareMarkAlive {
        // The replacing node has been observed alive; just refresh the
        // watchdog, no metadata change (spec.md §4.5 replace phase table).
        registry.heartbeat(req.ops_uuid, watchdog_silence, now).await?;
        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: registry.in_flight().await });
    }

    if req.cmd == NodeOpsCmd::ReplacePreparePendingRanges {
        registry.heartbeat(req.ops_uuid, watchdog_silence, now).await?;
        let mut tm = (*replicator.current().token_metadata).clone();
        for (ks, strategy) in local_db.keyspaces() {
            tm.update_pending_ranges(&ks, strategy, this_endpoint);
        }
        replicator.replicate_to_all_cores(tm, local_db, AcquireMergeLock::Yes).await?;
        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: registry.in_flight().await });
    }

    if req.cmd.is_done() {
        registry.done(req.ops_uuid).await?;
        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: vec![] });
    }

    if req.cmd.is_abort() {
        let action = registry.abort(req.ops_uuid).await?;
        let mut tm = (*replicator.current().token_metadata).clone();
        apply_abort_action(&mut tm, &action);
        replicator.replicate_to_all_cores(tm, local_db, AcquireMergeLock::Yes).await?;
        return Ok(NodeOpsCmdResponse { ok: true, pending_ops: vec![] });
    }

    // Heartbeat and `removenode_sync_data` just refresh the watchdog.
    registry.heartbeat(req.ops_uuid, watchdog_silence, now).await?;
    Ok(NodeOpsCmdResponse { ok: true, pending_ops: registry.in_flight().await })
}

/// Result of one fan-out phase across `sync_nodes` (spec.md §4.5
/// "Coordinator-side error taxonomy").
#[derive(Debug, Default)]
pub struct FanOutResult {
    pub applied: HashSet<Endpoint>,
    pub unknown_verb: HashSet<Endpoint>,
    pub unreachable: HashSet<Endpoint>,
    pub failed: Option<String>,
}

impl FanOutResult {
    pub fn is_clean(&self) -> bool {
        self.unknown_verb.is_empty() && self.unreachable.is_empty() && self.failed.is_none()
    }
}

/// Operator-side coordinator: owns the fan-out + heartbeat engine for all
/// four operations (spec.md §4.5).
pub struct NodeOpsCoordinator {
    messaging: Arc<dyn Messaging>,
    heartbeat_period: Duration,
}

impl NodeOpsCoordinator {
    pub fn new(messaging: Arc<dyn Messaging>, heartbeat_period: Duration) -> Self {
        Self { messaging, heartbeat_period }
    }

    /// Fans `req` out to every node in `nodes` concurrently (spec.md §4.5:
    /// the coordinator does not wait on one peer before contacting the
    /// next) and folds the per-peer outcomes into the §4.5 error taxonomy.
    async fn fan_out(&self, nodes: &[Endpoint], req: NodeOpsCmdRequest) -> FanOutResult {
        let mut in_flight: FuturesUnordered<_> = nodes
            .iter()
            .map(|&ep| {
                let messaging = self.messaging.clone();
                let req = req.clone();
                async move { (ep, messaging.send_node_ops_cmd(ep, req).await) }
            })
            .collect();

        let mut result = FanOutResult::default();
        while let Some((ep, outcome)) = in_flight.next().await {
            match outcome {
                Ok(resp) if resp.ok => {
                    result.applied.insert(ep);
                }
                Ok(_) => {
                    result.failed = Some(format!("peer {ep} rejected the command"));
                }
                Err(CoordinatorError::UnknownVerb(_)) => {
                    result.unknown_verb.insert(ep);
                }
                Err(CoordinatorError::PeerUnreachable(_)) => {
                    result.unreachable.insert(ep);
                }
                Err(e) => {
                    result.failed = Some(e.to_string());
                }
            }
        }
        result
    }

    fn abort_cmd_for(kind: NodeOpsKind) -> NodeOpsCmd {
        match kind {
            NodeOpsKind::Bootstrap => NodeOpsCmd::BootstrapAbort,
            NodeOpsKind::Replace => NodeOpsCmd::ReplaceAbort,
            NodeOpsKind::Decommission => NodeOpsCmd::DecommissionAbort,
            NodeOpsKind::Removenode => NodeOpsCmd::RemovenodeAbort,
        }
    }

    fn done_cmd_for(kind: NodeOpsKind) -> NodeOpsCmd {
        match kind {
            NodeOpsKind::Bootstrap => NodeOpsCmd::BootstrapDone,
            NodeOpsKind::Replace => NodeOpsCmd::ReplaceDone,
            NodeOpsKind::Decommission => NodeOpsCmd::DecommissionDone,
            NodeOpsKind::Removenode => NodeOpsCmd::RemovenodeDone,
        }
    }

    fn heartbeat_cmd_for(kind: NodeOpsKind) -> NodeOpsCmd {
        match kind {
            NodeOpsKind::Bootstrap => NodeOpsCmd::BootstrapHeartbeat,
            NodeOpsKind::Replace => NodeOpsCmd::ReplaceHeartbeat,
            NodeOpsKind::Decommission => NodeOpsCmd::DecommissionHeartbeat,
            NodeOpsKind::Removenode => NodeOpsCmd::RemovenodeHeartbeat,
        }
    }

    /// Runs one full operation: `*_prepare` fan-out, a background heartbeat
    /// loop while `local_work` runs, then `*_done` on success or `*_abort`
    /// on failure — sent only to peers that successfully applied
    /// `*_prepare` (spec.md §4.5).
    pub async fn run_operation(
        &self,
        kind: NodeOpsKind,
        ops_uuid: Uuid,
        sync_nodes: Vec<Endpoint>,
        mut base_req: NodeOpsCmdRequest,
        local_work: Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>,
    ) -> Result<()> {
        base_req.ops_uuid = ops_uuid;
        base_req.cmd = match kind {
            NodeOpsKind::Bootstrap => NodeOpsCmd::BootstrapPrepare,
            NodeOpsKind::Replace => NodeOpsCmd::ReplacePrepare,
            NodeOpsKind::Decommission => NodeOpsCmd::DecommissionPrepare,
            NodeOpsKind::Removenode => NodeOpsCmd::RemovenodePrepare,
        };

        let prepared = self.fan_out(&sync_nodes, base_req.clone()).await;
        if !prepared.is_clean() {
            self.abort_applied(kind, ops_uuid, &prepared.applied).await;
            return Err(self.explain_failure(&prepared));
        }

        // Replace has two extra prepare-phase RPCs beyond the other three
        // operations (spec.md §4.5: `replace_prepare` ->
        // `replace_prepare_mark_alive` -> `replace_prepare_pending_ranges`),
        // fanned out to the same peers that accepted `replace_prepare`
        // before the heartbeat loop starts.
        if kind == NodeOpsKind::Replace {
            let prepared_nodes: Vec<Endpoint> = prepared.applied.iter().copied().collect();

            let mark_alive_req =
                NodeOpsCmdRequest { cmd: NodeOpsCmd::ReplacePrepareMarkAlive, ..base_req.clone() };
            let mark_alive = self.fan_out(&prepared_nodes, mark_alive_req).await;
            if !mark_alive.is_clean() {
                self.abort_applied(kind, ops_uuid, &prepared.applied).await;
                return Err(self.explain_failure(&mark_alive));
            }

            let pending_ranges_req =
                NodeOpsCmdRequest { cmd: NodeOpsCmd::ReplacePreparePendingRanges, ..base_req.clone() };
            let pending_ranges = self.fan_out(&prepared_nodes, pending_ranges_req).await;
            if !pending_ranges.is_clean() {
                self.abort_applied(kind, ops_uuid, &prepared.applied).await;
                return Err(self.explain_failure(&pending_ranges));
            }
        }

        let heartbeat_req = NodeOpsCmdRequest { cmd: Self::heartbeat_cmd_for(kind), ..base_req.clone() };
        let heartbeat_nodes: Vec<Endpoint> = prepared.applied.iter().copied().collect();
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let messaging = self.messaging.clone();
        let period = self.heartbeat_period;
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        for &ep in &heartbeat_nodes {
                            let _ = messaging.send_node_ops_cmd(ep, heartbeat_req.clone()).await;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        let work_result = local_work.await;
        let _ = stop_tx.send(true);
        let _ = heartbeat_task.await;

        match work_result {
            Ok(()) => {
                let done_req = NodeOpsCmdRequest { cmd: Self::done_cmd_for(kind), ..base_req };
                let _ = self.fan_out(&prepared.applied.iter().copied().collect::<Vec<_>>(), done_req).await;
                Ok(())
            }
            Err(e) => {
                self.abort_applied(kind, ops_uuid, &prepared.applied).await;
                Err(e)
            }
        }
    }

    async fn abort_applied(&self, kind: NodeOpsKind, ops_uuid: Uuid, applied: &HashSet<Endpoint>) {
        if applied.is_empty() {
            return;
        }
        let req = NodeOpsCmdRequest {
            cmd: Self::abort_cmd_for(kind),
            ops_uuid,
            ignore_nodes: vec![],
            leaving_nodes: vec![],
            replace_nodes: vec![],
            bootstrap_nodes: vec![],
            repair_tables: vec![],
        };
        let nodes: Vec<Endpoint> = applied.iter().copied().collect();
        self.fan_out(&nodes, req).await;
    }

    fn explain_failure(&self, result: &FanOutResult) -> CoordinatorError {
        if !result.unknown_verb.is_empty() {
            return CoordinatorError::Fatal(format!(
                "peers {:?} do not support this operation; please upgrade them first",
                result.unknown_verb
            ));
        }
        if !result.unreachable.is_empty() {
            return CoordinatorError::Fatal(format!(
                "peers {:?} are unreachable; retry with --ignore-dead-nodes",
                result.unreachable
            ));
        }
        CoordinatorError::Fatal(result.failed.clone().unwrap_or_else(|| "unknown fan-out failure".into()))
    }
}
