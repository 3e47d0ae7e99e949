//! `coordinatord`: loads `CoordinatorConfig` and runs the join sequencer.
//!
//! The gossip bus, messaging layer, streaming engine, Raft group, local
//! database, and system keyspace are all traits (`collaborators`); a real
//! deployment wires its actual subsystems in here. This binary wires the
//! in-memory fakes so the coordinator is runnable standalone for manual
//! testing, the way the teacher's `main.rs` wires `MemTokens`/`MemBlocks`.

use log::info;
use membership_coordinator::collaborators::fakes::{
    FakeGossipBus, FakeLocalDatabase, FakeMessaging, FakeRaftGroup0, FakeStreamingEngine, FakeSystemKeyspace,
};
use membership_coordinator::join::JoinSequencer;
use membership_coordinator::mode::ModeState;
use membership_coordinator::replicator::MetadataReplicator;
use membership_coordinator::CoordinatorConfig;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

fn load_config(path: Option<&str>) -> CoordinatorConfig {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path).unwrap_or_else(|e| panic!("reading config {path}: {e}"));
            CoordinatorConfig::from_yaml(&raw).unwrap_or_else(|e| panic!("parsing config {path}: {e}"))
        }
        None => CoordinatorConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    info!("starting coordinatord");

    let mut args = env::args().skip(1);
    let config_path = args.next();
    let config = load_config(config_path.as_deref());

    let this_endpoint: SocketAddr = env::var("COORDINATOR_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7000".to_string())
        .parse()
        .expect("COORDINATOR_LISTEN_ADDR must be host:port");

    let replicator = Arc::new(MetadataReplicator::new(config.shard_count));
    let sequencer = JoinSequencer {
        replicator,
        gossip: Arc::new(FakeGossipBus::new()),
        messaging: Arc::new(FakeMessaging::new()),
        raft: Arc::new(FakeRaftGroup0::new()),
        streaming: Arc::new(FakeStreamingEngine::new()),
        local_db: Arc::new(FakeLocalDatabase::new(3)),
        system_keyspace: Arc::new(FakeSystemKeyspace::new()),
        mode: Mutex::new(ModeState::new()),
        config,
        this_endpoint,
        seeds: vec![this_endpoint],
        replace_target: None,
        operator_override_decommissioned: false,
    };

    match sequencer.join_token_ring().await {
        Ok(()) => info!("{this_endpoint} joined the ring, mode={:?}", sequencer.mode.lock().await.current()),
        Err(e) if e.is_fatal() => {
            log::error!("fatal startup condition: {e}");
            std::process::exit(1);
        }
        Err(e) => log::error!("join_token_ring failed: {e}"),
    }
}
