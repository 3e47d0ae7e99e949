//! External collaborator traits (spec.md §6, SPEC_FULL.md §B).
//!
//! The gossip bus, messaging layer, streaming engine, local database, Raft
//! group 0 client, and system keyspace are explicitly out of scope for
//! their wire encoding (spec.md §1). They're modeled the way the teacher
//! models storage: narrow traits (`EcTokens`, `EcBlocks`, `BatchedBackend`
//! in `ec_interface.rs`) with a swappable in-memory implementation
//! (`ec_memory_backend.rs`'s `MemoryBackend`).

use crate::node_ops::{NodeOpsCmdRequest, NodeOpsCmdResponse};
use crate::token_metadata::ReplicationStrategy;
use crate::types::{ApplicationState, CdcGenerationId, Endpoint, GossipClock, HostId, Token};
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait GossipBus: Send + Sync {
    /// Broadcast one application-state key/value pair about this node.
    async fn advertise(&self, key: ApplicationState, value: String);

    /// Broadcast several application-state key/value pairs in a single
    /// atomic batch, so no observer ever sees a partial update (spec.md §5
    /// "Gossip is single-source-of-truth").
    async fn advertise_batch(&self, entries: Vec<(ApplicationState, String)>);

    /// Current value of one peer's application-state key, if known.
    async fn peer_state(&self, endpoint: Endpoint, key: ApplicationState) -> Option<String>;

    /// The peer's current (generation, version) clock.
    async fn peer_clock(&self, endpoint: Endpoint) -> Option<GossipClock>;

    /// Whether the peer currently answers heartbeats (gossip-alive, not
    /// necessarily CQL-ready).
    async fn is_alive(&self, endpoint: Endpoint) -> bool;

    /// A one-shot shadow round: gossip with `seeds` only long enough to
    /// collect their current state, without announcing this node
    /// (GLOSSARY "Shadow round").
    async fn do_shadow_round(&self, seeds: &[Endpoint]) -> HashMap<Endpoint, HashMap<ApplicationState, String>>;
}

#[async_trait]
pub trait Messaging: Send + Sync {
    async fn send_node_ops_cmd(
        &self,
        to: Endpoint,
        req: NodeOpsCmdRequest,
    ) -> Result<NodeOpsCmdResponse, crate::error::CoordinatorError>;

    async fn send_replication_finished(&self, to: Endpoint, from: Endpoint)
        -> Result<(), crate::error::CoordinatorError>;
}

/// Opaque plan handed to the streaming engine; the transfer mechanics
/// themselves are out of scope (spec.md §1).
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub from: Vec<Endpoint>,
    pub to: Endpoint,
    pub keyspaces: Vec<String>,
}

#[async_trait]
pub trait StreamingEngine: Send + Sync {
    async fn stream_ranges(&self, plan: StreamPlan) -> Result<(), crate::error::CoordinatorError>;
}

#[async_trait]
pub trait LocalDatabase: Send + Sync {
    fn keyspaces(&self) -> Vec<(String, ReplicationStrategy)>;
}

#[async_trait]
pub trait RaftGroup0Client: Send + Sync {
    async fn join(&self) -> Result<(), crate::error::CoordinatorError>;
    async fn leave(&self) -> Result<(), crate::error::CoordinatorError>;
    async fn modify_config(
        &self,
        add: Vec<Endpoint>,
        del: Vec<Endpoint>,
    ) -> Result<(), crate::error::CoordinatorError>;
}

/// `bootstrap_state` values (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NeedsBootstrap,
    InProgress,
    Completed,
    Decommissioned,
}

#[async_trait]
pub trait SystemKeyspace: Send + Sync {
    async fn bootstrap_state(&self) -> BootstrapState;
    async fn set_bootstrap_state(&self, state: BootstrapState);

    async fn local_host_id(&self) -> Option<HostId>;
    async fn set_local_host_id(&self, id: HostId);

    async fn local_tokens(&self) -> Vec<Token>;
    async fn set_local_tokens(&self, tokens: Vec<Token>);

    async fn cdc_generation_id(&self) -> Option<CdcGenerationId>;
    async fn set_cdc_generation_id(&self, id: CdcGenerationId);

    async fn local_generation(&self) -> u64;
    async fn set_local_generation(&self, generation: u64);

    async fn peer_tokens(&self, endpoint: Endpoint) -> Vec<Token>;
    async fn set_peer_tokens(&self, endpoint: Endpoint, tokens: Vec<Token>);
}

pub mod fakes {
    //! In-memory test doubles, matching the shape of the teacher's
    //! `MemoryBackend` (`ec_memory_backend.rs`): all state behind a
    //! `std::sync::Mutex` so the fakes are safely `Send + Sync` across the
    //! `tokio` runtime used in tests.
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeGossipBus {
        inner: Mutex<FakeGossipBusInner>,
    }

    #[derive(Default)]
    struct FakeGossipBusInner {
        states: HashMap<Endpoint, HashMap<ApplicationState, String>>,
        clocks: HashMap<Endpoint, GossipClock>,
        alive: std::collections::HashSet<Endpoint>,
        self_state: HashMap<ApplicationState, String>,
    }

    impl FakeGossipBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_peer(&self, endpoint: Endpoint, clock: GossipClock, state: HashMap<ApplicationState, String>) {
            let mut inner = self.inner.lock().unwrap();
            inner.clocks.insert(endpoint, clock);
            inner.states.insert(endpoint, state);
            inner.alive.insert(endpoint);
        }

        pub fn mark_dead(&self, endpoint: Endpoint) {
            self.inner.lock().unwrap().alive.remove(&endpoint);
        }

        pub fn self_state(&self) -> HashMap<ApplicationState, String> {
            self.inner.lock().unwrap().self_state.clone()
        }
    }

    #[async_trait]
    impl GossipBus for FakeGossipBus {
        async fn advertise(&self, key: ApplicationState, value: String) {
            self.inner.lock().unwrap().self_state.insert(key, value);
        }

        async fn advertise_batch(&self, entries: Vec<(ApplicationState, String)>) {
            let mut inner = self.inner.lock().unwrap();
            for (k, v) in entries {
                inner.self_state.insert(k, v);
            }
        }

        async fn peer_state(&self, endpoint: Endpoint, key: ApplicationState) -> Option<String> {
            self.inner.lock().unwrap().states.get(&endpoint)?.get(&key).cloned()
        }

        async fn peer_clock(&self, endpoint: Endpoint) -> Option<GossipClock> {
            self.inner.lock().unwrap().clocks.get(&endpoint).copied()
        }

        async fn is_alive(&self, endpoint: Endpoint) -> bool {
            self.inner.lock().unwrap().alive.contains(&endpoint)
        }

        async fn do_shadow_round(
            &self,
            seeds: &[Endpoint],
        ) -> HashMap<Endpoint, HashMap<ApplicationState, String>> {
            let inner = self.inner.lock().unwrap();
            seeds
                .iter()
                .filter_map(|s| inner.states.get(s).map(|st| (*s, st.clone())))
                .collect()
        }
    }

    #[derive(Default)]
    pub struct FakeMessaging {
        pub responses: Mutex<HashMap<Endpoint, Result<NodeOpsCmdResponse, String>>>,
        /// Every `(endpoint, cmd)` sent, in order, so tests can assert which
        /// phases actually fired instead of only the end result.
        pub calls: Mutex<Vec<(Endpoint, crate::node_ops::NodeOpsCmd)>>,
    }

    impl FakeMessaging {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_response(&self, ep: Endpoint, resp: Result<NodeOpsCmdResponse, String>) {
            self.responses.lock().unwrap().insert(ep, resp);
        }

        pub fn calls_to(&self, ep: Endpoint) -> Vec<crate::node_ops::NodeOpsCmd> {
            self.calls.lock().unwrap().iter().filter(|(e, _)| *e == ep).map(|(_, c)| *c).collect()
        }
    }

    #[async_trait]
    impl Messaging for FakeMessaging {
        async fn send_node_ops_cmd(
            &self,
            to: Endpoint,
            req: NodeOpsCmdRequest,
        ) -> Result<NodeOpsCmdResponse, crate::error::CoordinatorError> {
            self.calls.lock().unwrap().push((to, req.cmd));
            match self.responses.lock().unwrap().get(&to) {
                Some(Ok(r)) => Ok(r.clone()),
                Some(Err(e)) if e == "unreachable" => Err(crate::error::CoordinatorError::PeerUnreachable(to)),
                Some(Err(e)) if e == "unknown_verb" => Err(crate::error::CoordinatorError::UnknownVerb(to)),
                Some(Err(e)) => Err(crate::error::CoordinatorError::Fatal(e.clone())),
                None => Ok(NodeOpsCmdResponse { ok: true, pending_ops: vec![] }),
            }
        }

        async fn send_replication_finished(
            &self,
            _to: Endpoint,
            _from: Endpoint,
        ) -> Result<(), crate::error::CoordinatorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeStreamingEngine {
        pub plans: Mutex<Vec<StreamPlan>>,
        pub fail: Mutex<bool>,
    }

    impl FakeStreamingEngine {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl StreamingEngine for FakeStreamingEngine {
        async fn stream_ranges(&self, plan: StreamPlan) -> Result<(), crate::error::CoordinatorError> {
            if *self.fail.lock().unwrap() {
                return Err(crate::error::CoordinatorError::Fatal("streaming failed".into()));
            }
            self.plans.lock().unwrap().push(plan);
            Ok(())
        }
    }

    pub struct FakeLocalDatabase {
        pub keyspaces: Vec<(String, ReplicationStrategy)>,
    }

    impl FakeLocalDatabase {
        pub fn new(rf: usize) -> Self {
            Self { keyspaces: vec![("system".to_string(), ReplicationStrategy { replication_factor: rf })] }
        }
    }

    impl LocalDatabase for FakeLocalDatabase {
        fn keyspaces(&self) -> Vec<(String, ReplicationStrategy)> {
            self.keyspaces.clone()
        }
    }

    #[derive(Default)]
    pub struct FakeRaftGroup0 {
        pub joined: Mutex<bool>,
    }

    impl FakeRaftGroup0 {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl RaftGroup0Client for FakeRaftGroup0 {
        async fn join(&self) -> Result<(), crate::error::CoordinatorError> {
            *self.joined.lock().unwrap() = true;
            Ok(())
        }
        async fn leave(&self) -> Result<(), crate::error::CoordinatorError> {
            *self.joined.lock().unwrap() = false;
            Ok(())
        }
        async fn modify_config(
            &self,
            _add: Vec<Endpoint>,
            _del: Vec<Endpoint>,
        ) -> Result<(), crate::error::CoordinatorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeSystemKeyspace {
        inner: Mutex<FakeSystemKeyspaceInner>,
    }

    #[derive(Default)]
    struct FakeSystemKeyspaceInner {
        bootstrap_state: Option<BootstrapState>,
        host_id: Option<HostId>,
        tokens: Vec<Token>,
        cdc_generation_id: Option<CdcGenerationId>,
        generation: u64,
        peer_tokens: HashMap<Endpoint, Vec<Token>>,
    }

    impl FakeSystemKeyspace {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SystemKeyspace for FakeSystemKeyspace {
        async fn bootstrap_state(&self) -> BootstrapState {
            self.inner.lock().unwrap().bootstrap_state.unwrap_or(BootstrapState::NeedsBootstrap)
        }
        async fn set_bootstrap_state(&self, state: BootstrapState) {
            self.inner.lock().unwrap().bootstrap_state = Some(state);
        }
        async fn local_host_id(&self) -> Option<HostId> {
            self.inner.lock().unwrap().host_id
        }
        async fn set_local_host_id(&self, id: HostId) {
            self.inner.lock().unwrap().host_id = Some(id);
        }
        async fn local_tokens(&self) -> Vec<Token> {
            self.inner.lock().unwrap().tokens.clone()
        }
        async fn set_local_tokens(&self, tokens: Vec<Token>) {
            self.inner.lock().unwrap().tokens = tokens;
        }
        async fn cdc_generation_id(&self) -> Option<CdcGenerationId> {
            self.inner.lock().unwrap().cdc_generation_id
        }
        async fn set_cdc_generation_id(&self, id: CdcGenerationId) {
            self.inner.lock().unwrap().cdc_generation_id = Some(id);
        }
        async fn local_generation(&self) -> u64 {
            self.inner.lock().unwrap().generation
        }
        async fn set_local_generation(&self, generation: u64) {
            self.inner.lock().unwrap().generation = generation;
        }
        async fn peer_tokens(&self, endpoint: Endpoint) -> Vec<Token> {
            self.inner.lock().unwrap().peer_tokens.get(&endpoint).cloned().unwrap_or_default()
        }
        async fn set_peer_tokens(&self, endpoint: Endpoint, tokens: Vec<Token>) {
            self.inner.lock().unwrap().peer_tokens.insert(endpoint, tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn fake_gossip_bus_advertise_batch_is_observable_as_one_unit() {
        let bus = FakeGossipBus::new();
        bus.advertise_batch(vec![
            (ApplicationState::Status, "NORMAL".into()),
            (ApplicationState::Tokens, "1,2,3".into()),
        ])
        .await;
        let state = bus.self_state();
        assert_eq!(state.get(&ApplicationState::Status).unwrap(), "NORMAL");
        assert_eq!(state.get(&ApplicationState::Tokens).unwrap(), "1,2,3");
    }

    #[tokio::test]
    async fn fake_system_keyspace_persists_bootstrap_state() {
        let sk = FakeSystemKeyspace::new();
        assert_eq!(sk.bootstrap_state().await, BootstrapState::NeedsBootstrap);
        sk.set_bootstrap_state(BootstrapState::Completed).await;
        assert_eq!(sk.bootstrap_state().await, BootstrapState::Completed);
    }
}
