//! Cross-module scenario tests (spec.md §8 S1-S7), driven against the
//! in-memory fakes of every external collaborator.

use membership_coordinator::collaborators::fakes::{
    FakeGossipBus, FakeLocalDatabase, FakeMessaging, FakeRaftGroup0, FakeStreamingEngine, FakeSystemKeyspace,
};
use membership_coordinator::gossip_handler::GossipHandler;
use membership_coordinator::join::JoinSequencer;
use membership_coordinator::mode::{Mode, ModeState};
use membership_coordinator::node_ops::{
    node_ops_cmd_handler, AbortAction, NodeOpsCmd, NodeOpsCmdRequest, NodeOpsCoordinator, NodeOpsKind,
    NodeOpsRegistry,
};
use membership_coordinator::notifier::LifecycleNotifier;
use membership_coordinator::replicator::MetadataReplicator;
use membership_coordinator::types::{ApplicationState, GossipClock, Token};
use membership_coordinator::CoordinatorConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

fn ep(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7000)
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        num_tokens: 4,
        ring_delay: Duration::from_millis(20),
        gossip_interval: Duration::from_millis(5),
        shadow_round_timeout: Duration::from_millis(100),
        consistent_rangemovement_retry: Duration::from_millis(100),
        wait_alive_timeout: Duration::from_millis(50),
        watchdog_silence: Duration::from_secs(120),
        heartbeat_period: Duration::from_millis(10),
        ..Default::default()
    }
}

fn sequencer(seeds: Vec<SocketAddr>, this_endpoint: SocketAddr) -> (JoinSequencer, Arc<FakeGossipBus>) {
    let gossip = Arc::new(FakeGossipBus::new());
    let seq = JoinSequencer {
        replicator: Arc::new(MetadataReplicator::new(1)),
        gossip: gossip.clone(),
        messaging: Arc::new(FakeMessaging::new()),
        raft: Arc::new(FakeRaftGroup0::new()),
        streaming: Arc::new(FakeStreamingEngine::new()),
        local_db: Arc::new(FakeLocalDatabase::new(1)),
        system_keyspace: Arc::new(FakeSystemKeyspace::new()),
        mode: Mutex::new(ModeState::new()),
        config: fast_config(),
        this_endpoint,
        seeds,
        replace_target: None,
        operator_override_decommissioned: false,
    };
    (seq, gossip)
}

/// S1: a single seed equal to this node's address, no loaded endpoints.
#[tokio::test]
async fn s1_first_node_skips_bootstrap_and_reaches_normal() {
    let (seq, _gossip) = sequencer(vec![ep(1)], ep(1));
    seq.join_token_ring().await.unwrap();

    assert_eq!(seq.mode.lock().await.current(), Mode::Normal);
    let tm = seq.replicator.current().token_metadata;
    assert_eq!(tm.normal_tokens.len(), 4);
    assert!(tm.normal_tokens.values().all(|&e| e == ep(1)));
}

/// S2: two seeds, one already NORMAL. This node should bootstrap,
/// observe a normal owner, pick tokens, and announce NORMAL.
#[tokio::test]
async fn s2_second_node_bootstraps_against_a_live_seed() {
    let (seq, gossip) = sequencer(vec![ep(1), ep(2)], ep(2));
    gossip.seed_peer(
        ep(1),
        GossipClock { generation: 1, version: 1 },
        std::collections::HashMap::from([(ApplicationState::Status, "NORMAL".to_string())]),
    );
    // The gossip handler on the real ep(1) would have already advertised
    // itself as a normal token owner; seed that directly into this node's
    // working metadata so `bootstrap()`'s "at least one normal owner
    // visible" check is satisfied, exactly as the gossip subscription loop
    // would have done before `join_token_ring` runs.
    {
        let mut tm = (*seq.replicator.current().token_metadata).clone();
        tm.update_normal_tokens(&[Token(1)], ep(1), GossipClock { generation: 1, version: 1 });
        seq.replicator
            .replicate_to_all_cores(tm, seq.local_db.as_ref(), membership_coordinator::replicator::AcquireMergeLock::Yes)
            .await
            .unwrap();
    }

    seq.join_token_ring().await.unwrap();

    assert_eq!(seq.mode.lock().await.current(), Mode::Normal);
    let tm = seq.replicator.current().token_metadata;
    assert!(tm.normal_tokens.values().any(|&e| e == ep(2)));
    assert_eq!(tm.normal_tokens.values().filter(|&&e| e == ep(2)).count(), 4);
}

/// S3: another peer is STATUS=BOOTSTRAPPING and `consistent_rangemovement`
/// is on; this node's join must fail after the shadow-round bound elapses.
#[tokio::test]
async fn s3_concurrent_bootstrap_is_refused() {
    let (seq, gossip) = sequencer(vec![ep(1), ep(2)], ep(2));
    gossip.seed_peer(
        ep(1),
        GossipClock { generation: 1, version: 1 },
        std::collections::HashMap::from([(ApplicationState::Status, "BOOTSTRAPPING,1".to_string())]),
    );

    let err = seq.join_token_ring().await.unwrap_err();
    assert!(matches!(err, membership_coordinator::CoordinatorError::Transient { .. }));
}

/// S4: single-node decommission of a three-node cluster. Both peers accept
/// `decommission_prepare`, heartbeats flow, `decommission_done` clears
/// their `leaving_endpoints` back to empty.
#[tokio::test]
async fn s4_decommission_happy_path_clears_peer_leaving_endpoints() {
    let messaging = Arc::new(FakeMessaging::new());
    messaging.set_response(ep(2), Ok(ok_response()));
    messaging.set_response(ep(3), Ok(ok_response()));
    let coordinator = NodeOpsCoordinator::new(messaging.clone(), Duration::from_millis(5));

    // Model peer-side state directly: each peer has its own registry and
    // replicator, reached through `node_ops_cmd_handler` exactly as the
    // real messaging layer would dispatch an incoming request.
    let peer2_replicator = MetadataReplicator::new(1);
    let peer2_registry = NodeOpsRegistry::new();
    let peer2_db = FakeLocalDatabase::new(1);

    let leaving = ep(1);
    let ops_uuid = Uuid::new_v4();
    let prepare_req = NodeOpsCmdRequest {
        cmd: NodeOpsCmd::DecommissionPrepare,
        ops_uuid,
        ignore_nodes: vec![],
        leaving_nodes: vec![leaving],
        replace_nodes: vec![],
        bootstrap_nodes: vec![],
        repair_tables: vec![],
    };
    node_ops_cmd_handler(&peer2_registry, &peer2_replicator, &peer2_db, ep(2), Duration::from_secs(120), Instant::now(), prepare_req.clone())
        .await
        .unwrap();
    assert!(peer2_replicator.current().token_metadata.leaving_endpoints.contains(&leaving));

    let result = coordinator
        .run_operation(
            NodeOpsKind::Decommission,
            ops_uuid,
            vec![ep(2), ep(3)],
            NodeOpsCmdRequest { leaving_nodes: vec![leaving], ..prepare_req },
            Box::pin(async { Ok(()) }),
        )
        .await;
    assert!(result.is_ok());

    let done_req = NodeOpsCmdRequest {
        cmd: NodeOpsCmd::DecommissionDone,
        ops_uuid,
        ignore_nodes: vec![],
        leaving_nodes: vec![],
        replace_nodes: vec![],
        bootstrap_nodes: vec![],
        repair_tables: vec![],
    };
    node_ops_cmd_handler(&peer2_registry, &peer2_replicator, &peer2_db, ep(2), Duration::from_secs(120), Instant::now(), done_req)
        .await
        .unwrap();
    assert!(peer2_registry.in_flight().await.is_empty());
}

fn ok_response() -> membership_coordinator::node_ops::NodeOpsCmdResponse {
    membership_coordinator::node_ops::NodeOpsCmdResponse { ok: true, pending_ops: vec![] }
}

/// S5: `replace_prepare` fan-out hits one unreachable peer; the operation
/// fails and the still-alive peer receives an abort (no stale
/// `replacing_endpoints` edge survives).
#[tokio::test]
async fn s5_replace_aborts_surviving_peer_when_one_peer_is_unreachable() {
    let messaging = Arc::new(FakeMessaging::new());
    messaging.set_response(ep(2), Ok(ok_response()));
    messaging.set_response(ep(3), Err("unreachable".to_string()));
    let coordinator = NodeOpsCoordinator::new(messaging.clone(), Duration::from_millis(5));

    let peer2_replicator = MetadataReplicator::new(1);
    let peer2_registry = NodeOpsRegistry::new();
    let peer2_db = FakeLocalDatabase::new(1);

    let existing = ep(1);
    let replacing = ep(4);
    let ops_uuid = Uuid::new_v4();
    {
        let mut tm = (*peer2_replicator.current().token_metadata).clone();
        tm.update_normal_tokens(&[Token(1)], existing, GossipClock { generation: 1, version: 1 });
        peer2_replicator
            .replicate_to_all_cores(tm, &peer2_db, membership_coordinator::replicator::AcquireMergeLock::Yes)
            .await
            .unwrap();
    }
    let prepare_req = NodeOpsCmdRequest {
        cmd: NodeOpsCmd::ReplacePrepare,
        ops_uuid,
        ignore_nodes: vec![],
        leaving_nodes: vec![],
        replace_nodes: vec![(existing, replacing)],
        bootstrap_nodes: vec![],
        repair_tables: vec![],
    };
    node_ops_cmd_handler(&peer2_registry, &peer2_replicator, &peer2_db, ep(2), Duration::from_secs(120), Instant::now(), prepare_req.clone())
        .await
        .unwrap();
    assert_eq!(peer2_replicator.current().token_metadata.replacing_endpoints.get(&existing), Some(&replacing));

    let result = coordinator
        .run_operation(NodeOpsKind::Replace, ops_uuid, vec![ep(2), ep(3)], prepare_req, Box::pin(async { Ok(()) }))
        .await;
    assert!(result.is_err());

    let abort_req = NodeOpsCmdRequest {
        cmd: NodeOpsCmd::ReplaceAbort,
        ops_uuid,
        ignore_nodes: vec![],
        leaving_nodes: vec![],
        replace_nodes: vec![],
        bootstrap_nodes: vec![],
        repair_tables: vec![],
    };
    node_ops_cmd_handler(&peer2_registry, &peer2_replicator, &peer2_db, ep(2), Duration::from_secs(120), Instant::now(), abort_req)
        .await
        .unwrap();
    assert!(!peer2_replicator.current().token_metadata.replacing_endpoints.contains_key(&existing));
}

/// S6: after 120s of silence, a peer's watchdog fires, `abort_fn` runs,
/// the operation is removed, and a fresh prepare is then accepted.
#[tokio::test]
async fn s6_watchdog_expiry_restores_metadata_and_unblocks_new_prepare() {
    let registry = NodeOpsRegistry::new();
    let start = Instant::now();
    let first = Uuid::new_v4();
    registry
        .accept_prepare(first, ep(1), NodeOpsKind::Removenode, AbortAction::DelLeavingEndpoint(ep(9)), Duration::from_secs(120), start)
        .await
        .unwrap();

    let after_silence = start + Duration::from_secs(121);
    let expired = registry.reap_expired(after_silence).await;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, first);
    assert!(registry.in_flight().await.is_empty());

    let second = Uuid::new_v4();
    registry
        .accept_prepare(second, ep(1), NodeOpsKind::Removenode, AbortAction::DelLeavingEndpoint(ep(9)), Duration::from_secs(120), after_silence)
        .await
        .unwrap();
    assert_eq!(registry.in_flight().await, vec![second]);
}

/// S7: two endpoints claim the same host id in `handle_state_normal`; the
/// later gossip generation wins and the other endpoint's tokens are
/// removed once it loses every token.
#[tokio::test]
async fn s7_host_id_collision_later_generation_wins() {
    let gossip = Arc::new(FakeGossipBus::new());
    let h = GossipHandler {
        replicator: Arc::new(MetadataReplicator::new(1)),
        gossip: gossip.clone(),
        messaging: Arc::new(FakeMessaging::new()),
        streaming: Arc::new(FakeStreamingEngine::new()),
        local_db: Arc::new(FakeLocalDatabase::new(1)),
        system_keyspace: Arc::new(FakeSystemKeyspace::new()),
        notifier: Arc::new(LifecycleNotifier::new()),
        this_endpoint: ep(1),
    };

    gossip.seed_peer(
        ep(2),
        GossipClock { generation: 1, version: 1 },
        std::collections::HashMap::from([(ApplicationState::Tokens, "10".to_string())]),
    );
    h.handle_state_normal(ep(2)).await.unwrap();

    gossip.seed_peer(
        ep(3),
        GossipClock { generation: 2, version: 1 },
        std::collections::HashMap::from([(ApplicationState::Tokens, "10".to_string())]),
    );
    h.handle_state_normal(ep(3)).await.unwrap();

    let tm = h.replicator.current().token_metadata;
    assert_eq!(tm.normal_tokens.get(&Token(10)), Some(&ep(3)));
    assert!(!tm.normal_tokens.values().any(|&e| e == ep(2)));
}
