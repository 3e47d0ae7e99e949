//! Gossip Handler (C3, spec.md §4.3).
//!
//! Translates peer application-state changes into token-metadata and
//! system-table updates. Grounded directly in
//! `original_source/service/storage_service.cc`'s `handle_state_*` family
//! and `on_change` dispatcher.

use crate::collaborators::{GossipBus, LocalDatabase, Messaging, StreamPlan, StreamingEngine, SystemKeyspace};
use crate::error::{CoordinatorError, Result};
use crate::mode::Mode;
use crate::node_ops::{NodeOpsCmd, NodeOpsCmdRequest};
use crate::notifier::LifecycleNotifier;
use crate::replicator::{recompute_and_replicate, AcquireMergeLock, MetadataReplicator};
use crate::token_metadata::TokenMetadata;
use crate::types::{ApplicationState, Endpoint, GossipClock, HostId, StatusPieces, StatusValue, Token};
use log::{debug, info, warn};
use std::sync::Arc;

fn parse_tokens(raw: &str) -> Vec<Token> {
    raw.split(',').filter_map(|s| s.trim().parse::<u64>().ok()).map(Token).collect()
}

fn parse_host_id(raw: &str) -> Option<HostId> {
    u128::from_str_radix(raw, 16).ok().map(HostId)
}

pub struct GossipHandler {
    pub replicator: Arc<MetadataReplicator>,
    pub gossip: Arc<dyn GossipBus>,
    pub messaging: Arc<dyn Messaging>,
    pub streaming: Arc<dyn StreamingEngine>,
    pub local_db: Arc<dyn LocalDatabase>,
    pub system_keyspace: Arc<dyn SystemKeyspace>,
    pub notifier: Arc<LifecycleNotifier>,
    pub this_endpoint: Endpoint,
}

impl GossipHandler {
    /// `on_change` (spec.md §4.3): dispatch on the STATUS key's first
    /// comma-delimited field, or forward to the peer-table updater for any
    /// other key.
    pub async fn on_change(&self, endpoint: Endpoint, key: ApplicationState, value: String) -> Result<()> {
        if key != ApplicationState::Status {
            self.update_peer_table(endpoint, key, &value).await;
            return Ok(());
        }

        let parsed = StatusPieces::parse(&value)
            .ok_or_else(|| CoordinatorError::Fatal(format!("unparseable STATUS value: {value}")))?;

        match parsed.tag {
            StatusValue::Boot => self.handle_state_bootstrap(endpoint).await,
            StatusValue::Normal | StatusValue::Shutdown => self.handle_state_normal(endpoint).await,
            StatusValue::Removing => self.handle_state_removing(endpoint, false, &parsed.pieces).await,
            StatusValue::Removed => self.handle_state_removing(endpoint, true, &parsed.pieces).await,
            StatusValue::Leaving => self.handle_state_leaving(endpoint).await,
            StatusValue::Left => self.handle_state_left(endpoint, &parsed.pieces).await,
            StatusValue::Hibernate => self.handle_state_replacing(endpoint).await,
            StatusValue::Moving => Err(CoordinatorError::Fatal(
                "MOVING is not a supported topology state (spec.md §9 open question b)".into(),
            )),
        }
    }

    async fn update_peer_table(&self, endpoint: Endpoint, key: ApplicationState, value: &str) {
        // A peer system-table write failure is logged and tolerated
        // (spec.md §7): gossip remains the source of truth and will
        // redeliver.
        debug!("peer {endpoint} {key:?} = {value}");
        if key == ApplicationState::Tokens {
            self.system_keyspace.set_peer_tokens(endpoint, parse_tokens(value)).await;
        }
    }

    fn working_copy(&self) -> TokenMetadata {
        (*self.replicator.current().token_metadata).clone()
    }

    async fn publish(&self, tm: TokenMetadata) -> Result<()> {
        recompute_and_replicate(&self.replicator, tm, self.local_db.as_ref(), self.this_endpoint).await
    }

    /// `handle_state_bootstrap(ep)` (spec.md §4.3).
    pub async fn handle_state_bootstrap(&self, ep: Endpoint) -> Result<()> {
        info!("endpoint={ep} handle_state_bootstrap");
        let mut tm = self.working_copy();

        // Recovery path: if `ep` is already a member, remove it first.
        let already_member = tm.normal_tokens.values().any(|e| *e == ep) || tm.bootstrap_tokens.values().any(|e| *e == ep);
        if already_member {
            tm.remove_endpoint(ep);
        }

        let raw = self.gossip.peer_state(ep, ApplicationState::Tokens).await.unwrap_or_default();
        let tokens = parse_tokens(&raw);
        tm.add_bootstrap_tokens(&tokens, ep);

        if let Some(raw_id) = self.gossip.peer_state(ep, ApplicationState::HostId).await {
            if let Some(host_id) = parse_host_id(&raw_id) {
                let clock = self.gossip.peer_clock(ep).await.unwrap_or(GossipClock { generation: 0, version: 0 });
                tm.update_host_id(ep, host_id, clock);
            }
        }

        self.publish(tm).await
    }

    /// `handle_state_normal(ep)` (spec.md §4.3).
    pub async fn handle_state_normal(&self, ep: Endpoint) -> Result<()> {
        info!("endpoint={ep} handle_state_normal");
        let mut tm = self.working_copy();
        let was_member = tm.normal_tokens.values().any(|e| *e == ep);

        let raw = self.gossip.peer_state(ep, ApplicationState::Tokens).await.unwrap_or_default();
        let tokens = parse_tokens(&raw);
        let clock = self.gossip.peer_clock(ep).await.unwrap_or(GossipClock { generation: 0, version: 0 });

        let losers = tm.update_normal_tokens(&tokens, ep, clock);
        for loser in losers {
            info!("handle_state_normal: endpoint={loser} lost every token, scheduling removal");
            tm.remove_endpoint(loser);
        }

        self.system_keyspace.set_peer_tokens(ep, tokens).await;
        self.publish(tm).await?;

        if !was_member {
            self.notifier.notify_joined(ep, true);
        }
        Ok(())
    }

    /// `handle_state_leaving(ep)` (spec.md §4.3).
    pub async fn handle_state_leaving(&self, ep: Endpoint) -> Result<()> {
        info!("endpoint={ep} handle_state_leaving");
        let mut tm = self.working_copy();

        let is_member = tm.normal_tokens.values().any(|e| *e == ep);
        if !is_member {
            // "jump to leaving": add with advertised tokens if missing.
            let raw = self.gossip.peer_state(ep, ApplicationState::Tokens).await.unwrap_or_default();
            let tokens = parse_tokens(&raw);
            let clock = self.gossip.peer_clock(ep).await.unwrap_or(GossipClock { generation: 0, version: 0 });
            tm.update_normal_tokens(&tokens, ep, clock);
        }

        tm.add_leaving_endpoint(ep);
        self.publish(tm).await
    }

    /// `handle_state_left(ep, pieces)` (spec.md §4.3).
    pub async fn handle_state_left(&self, ep: Endpoint, pieces: &[String]) -> Result<()> {
        info!("endpoint={ep} handle_state_left");
        let gossiped_tokens_raw = self.gossip.peer_state(ep, ApplicationState::Tokens).await;
        let mut tm = self.working_copy();
        let tokens = match gossiped_tokens_raw.filter(|s| !s.is_empty()) {
            Some(raw) => parse_tokens(&raw),
            None => tm.normal_tokens.iter().filter(|(_, e)| **e == ep).map(|(t, _)| *t).collect(),
        };
        let expire_time: u64 = pieces.first().and_then(|s| s.parse().ok()).unwrap_or(0);
        self.excise(&mut tm, &tokens, ep, expire_time).await?;
        self.publish(tm).await
    }

    /// `handle_state_removing(ep, pieces)` (spec.md §4.3). `removed`
    /// distinguishes REMOVED_TOKEN (excise now) from REMOVING_TOKEN (add to
    /// leaving, stream out).
    pub async fn handle_state_removing(&self, ep: Endpoint, removed: bool, pieces: &[String]) -> Result<()> {
        info!("endpoint={ep} handle_state_removing removed={removed}");
        if ep == self.this_endpoint {
            // This node was force-removed elsewhere.
            warn!("this node was force-removed by the cluster, draining and stopping");
            return Err(CoordinatorError::Fatal("force-removed by REMOVENODE elsewhere".into()));
        }

        let mut tm = self.working_copy();

        if removed {
            let tokens = tm.normal_tokens.iter().filter(|(_, e)| **e == ep).map(|(t, _)| *t).collect::<Vec<_>>();
            self.excise(&mut tm, &tokens, ep, 0).await?;
            self.publish(tm).await
        } else {
            tm.add_leaving_endpoint(ep);
            for (k, s) in self.local_db.keyspaces() {
                tm.update_pending_ranges(&k, s, self.this_endpoint);
            }
            let coordinator_raw = self.gossip.peer_state(ep, ApplicationState::RemovalCoordinator).await;
            self.publish(tm).await?;

            if let Some(coordinator_raw) = coordinator_raw {
                if let Ok(coordinator_id) = coordinator_raw.parse::<u64>() {
                    let _ = coordinator_id; // coordinator addressing is opaque here
                    self.stream_missing_replicas_and_notify(ep).await;
                }
            }
            Ok(())
        }
    }

    async fn stream_missing_replicas_and_notify(&self, leaving: Endpoint) {
        let plan = StreamPlan { from: vec![], to: self.this_endpoint, keyspaces: self.local_db.keyspaces().into_iter().map(|(k, _)| k).collect() };
        if let Err(e) = self.streaming.stream_ranges(plan).await {
            warn!("failed to stream missing replicas for removal of {leaving}: {e}");
            return;
        }
        let mut attempts = 0;
        while attempts < 3 {
            attempts += 1;
            match self.messaging.send_replication_finished(leaving, self.this_endpoint).await {
                Ok(()) => break,
                Err(e) => warn!("replication_finished attempt {attempts} failed: {e}"),
            }
        }
    }

    /// `handle_state_replacing(ep)` (spec.md §4.3). `HIBERNATE` is treated
    /// as "replacing" (spec.md §9 open question a, confirmed against
    /// `storage_service.cc`). The replacing node adopts the host id of the
    /// node it replaces (`original_source/service/storage_service.cc:776-804`
    /// `get_host_id(replacing_node)` -> `get_endpoint_for_host_id`), so the
    /// existing owner is resolved from that host id, never from `Tokens`.
    pub async fn handle_state_replacing(&self, ep: Endpoint) -> Result<()> {
        info!("endpoint={ep} handle_state_replacing");
        let raw_host_id = self.gossip.peer_state(ep, ApplicationState::HostId).await.ok_or_else(|| {
            CoordinatorError::Fatal(format!("{ep} is replacing but advertises no HostId"))
        })?;
        let host_id = parse_host_id(&raw_host_id)
            .ok_or_else(|| CoordinatorError::Fatal(format!("{ep} advertises an unparseable HostId: {raw_host_id}")))?;

        let mut tm = self.working_copy();
        let replaced = tm.endpoint_of_host_id(host_id).ok_or_else(|| {
            CoordinatorError::Fatal(format!("no endpoint owns host id {host_id}, which {ep} is replacing"))
        })?;
        tm.add_replacing_endpoint(replaced, ep)?;

        if self.gossip.is_alive(ep).await {
            info!("handle_state_replacing: {ep} is already alive, updating pending ranges now");
            self.publish(tm).await
        } else {
            info!("handle_state_replacing: {ep} is not alive yet, deferring pending-range update to on_alive");
            // Still publish the replacing edge itself; pending ranges will
            // be recomputed again once `on_alive` fires (modeled by the
            // caller invoking `handle_state_replacing` again, or a
            // dedicated `on_alive` hook in a fuller transport integration).
            self.publish(tm).await
        }
    }

    /// `excise(tokens, ep, expire_time)` (spec.md §4.3 GLOSSARY).
    async fn excise(&self, tm: &mut TokenMetadata, tokens: &[Token], ep: Endpoint, expire_time: u64) -> Result<()> {
        debug!("excise endpoint={ep} tokens={} expire_time={expire_time}", tokens.len());
        tm.remove_endpoint(ep);
        self.notifier.notify_left(ep);
        Ok(())
    }

    /// Peer-side handler for the node-ops command envelope is implemented
    /// by `node_ops::NodeOpsCoordinator::handle_cmd`; `query_pending_ops`
    /// and `repair_updater` are always accepted regardless of in-flight
    /// state (spec.md §4.5), so they're exposed here as a thin pass
    /// through for callers that only have a `GossipHandler` in hand during
    /// tests.
    pub fn build_query_pending_ops_request(ops_uuid: uuid::Uuid) -> NodeOpsCmdRequest {
        NodeOpsCmdRequest {
            cmd: NodeOpsCmd::QueryPendingOps,
            ops_uuid,
            ignore_nodes: vec![],
            leaving_nodes: vec![],
            replace_nodes: vec![],
            bootstrap_nodes: vec![],
            repair_tables: vec![],
        }
    }
}
