//! Token Metadata (C1, spec.md §3, §4.1).
//!
//! The authoritative token -> endpoint map plus the pending-ranges overlay.
//! Modeled after the teacher's peer tables in `ec_peers.rs` (`BTreeMap`,
//! `BTreeSet` for ordered membership) but, unlike `EcPeers`, this structure
//! is treated as immutable-by-readers: a mutation path produces a new
//! snapshot rather than mutating shared state in place (spec.md §3
//! "Ownership").

use crate::error::{CoordinatorError, Result};
use crate::types::{Endpoint, GossipClock, HostId, Token};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A half-open range on the ring, `(start, end]` per the GLOSSARY's
/// "token ownership" definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Token,
    pub end: Token,
}

/// The set of ranges this endpoint is about to gain or lose under the
/// currently-running topology changes, for one keyspace (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRanges {
    pub gaining: BTreeSet<Range>,
    pub losing: BTreeSet<Range>,
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Range {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.start, self.end).cmp(&(other.start, other.end))
    }
}

/// A replication strategy, opaque here (spec.md §1: schema and replication
/// strategy interpretation belongs to the Local Database collaborator).
/// Only the data needed to compute pending ranges is kept: replication
/// factor.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationStrategy {
    pub replication_factor: usize,
}

/// The central snapshot (spec.md §3). Readers get `Arc<TokenMetadata>` from
/// the replicator (C6); this type itself carries no interior mutability.
#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    pub normal_tokens: BTreeMap<Token, Endpoint>,
    pub bootstrap_tokens: BTreeMap<Token, Endpoint>,
    pub leaving_endpoints: BTreeSet<Endpoint>,
    pub replacing_endpoints: HashMap<Endpoint, Endpoint>,
    pub endpoint_to_host_id: HashMap<Endpoint, HostId>,
    host_id_to_endpoint: HashMap<HostId, Endpoint>,
    /// Generation/version each endpoint was last updated at, used for
    /// collision tie-breaks (spec.md §4.1, §9).
    pub endpoint_clocks: HashMap<Endpoint, GossipClock>,
    pub pending_ranges: HashMap<String, PendingRanges>,
    pub ring_version: u64,
}

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sorted view of `normal_tokens ∪ bootstrap_tokens` keys
    /// (spec.md §3).
    pub fn sorted_tokens(&self) -> Vec<Token> {
        let mut all: Vec<Token> = self
            .normal_tokens
            .keys()
            .chain(self.bootstrap_tokens.keys())
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    fn bump(&mut self) {
        self.ring_version += 1;
    }

    /// Tie-break for a token claimed by two endpoints: the endpoint with
    /// the later (generation, version) wins (spec.md §4.1).
    fn wins(&self, candidate: Endpoint, candidate_clock: GossipClock, incumbent: Endpoint) -> bool {
        let incumbent_clock = self.endpoint_clocks.get(&incumbent).copied();
        match incumbent_clock {
            None => true,
            Some(existing) => candidate_clock > existing || candidate == incumbent,
        }
    }

    /// `update_normal_tokens(tokens, endpoint)` (spec.md §4.1). Claims each
    /// token for `endpoint`, applying the generation tie-break against any
    /// current normal owner, and records `clock` as the endpoint's latest
    /// observed gossip clock. Returns the set of endpoints that lost every
    /// token they owned (candidates for removal, per
    /// `handle_state_normal`).
    pub fn update_normal_tokens(
        &mut self,
        tokens: &[Token],
        endpoint: Endpoint,
        clock: GossipClock,
    ) -> BTreeSet<Endpoint> {
        let mut losers = BTreeSet::new();
        for &t in tokens {
            self.bootstrap_tokens.remove(&t);
            match self.normal_tokens.get(&t).copied() {
                None => {
                    self.normal_tokens.insert(t, endpoint);
                }
                Some(current) if current == endpoint => {}
                Some(current) => {
                    if self.wins(endpoint, clock, current) {
                        self.normal_tokens.insert(t, endpoint);
                        if !self.normal_tokens.values().any(|e| *e == current) {
                            losers.insert(current);
                        }
                    }
                }
            }
        }
        self.endpoint_clocks.insert(endpoint, clock);
        self.bump();
        losers
    }

    pub fn add_bootstrap_tokens(&mut self, tokens: &[Token], endpoint: Endpoint) {
        for &t in tokens {
            self.bootstrap_tokens.insert(t, endpoint);
        }
        self.bump();
    }

    pub fn remove_bootstrap_tokens(&mut self, tokens: &[Token]) {
        for t in tokens {
            self.bootstrap_tokens.remove(t);
        }
        self.bump();
    }

    pub fn add_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.insert(endpoint);
        self.bump();
    }

    pub fn del_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.remove(&endpoint);
        self.bump();
    }

    /// `add_replacing_endpoint(existing, replacing)` (spec.md §3 invariant
    /// 3, §4.1).
    pub fn add_replacing_endpoint(&mut self, existing: Endpoint, replacing: Endpoint) -> Result<()> {
        if !self.normal_tokens.values().any(|e| *e == existing) {
            return Err(CoordinatorError::Fatal(format!(
                "cannot replace {existing}: it owns no normal tokens"
            )));
        }
        if self.normal_tokens.values().any(|e| *e == replacing) {
            return Err(CoordinatorError::Fatal(format!(
                "cannot replace with {replacing}: it already owns normal tokens"
            )));
        }
        self.replacing_endpoints.insert(existing, replacing);
        self.bump();
        Ok(())
    }

    pub fn del_replacing_endpoint(&mut self, existing: Endpoint) {
        self.replacing_endpoints.remove(&existing);
        self.bump();
    }

    /// `update_host_id` (spec.md §4.1). Collisions resolved identically to
    /// token collisions: later (generation, version) wins (spec.md §9).
    pub fn update_host_id(&mut self, endpoint: Endpoint, host_id: HostId, clock: GossipClock) {
        if let Some(&current_owner) = self.host_id_to_endpoint.get(&host_id) {
            if current_owner != endpoint {
                let current_clock = self.endpoint_clocks.get(&current_owner).copied();
                let endpoint_wins = match current_clock {
                    None => true,
                    Some(existing) => clock > existing,
                };
                if !endpoint_wins {
                    return;
                }
                self.endpoint_to_host_id.remove(&current_owner);
            }
        }
        if let Some(old_id) = self.endpoint_to_host_id.insert(endpoint, host_id) {
            self.host_id_to_endpoint.remove(&old_id);
        }
        self.host_id_to_endpoint.insert(host_id, endpoint);
        self.bump();
    }

    pub fn host_id_of(&self, endpoint: Endpoint) -> Option<HostId> {
        self.endpoint_to_host_id.get(&endpoint).copied()
    }

    pub fn endpoint_of_host_id(&self, host_id: HostId) -> Option<Endpoint> {
        self.host_id_to_endpoint.get(&host_id).copied()
    }

    /// `remove_endpoint` (spec.md §4.1): excises an endpoint from every
    /// table. Used by `excise` in the gossip handler.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        self.normal_tokens.retain(|_, e| *e != endpoint);
        self.bootstrap_tokens.retain(|_, e| *e != endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.replacing_endpoints.retain(|e, r| *e != endpoint && *r != endpoint);
        if let Some(id) = self.endpoint_to_host_id.remove(&endpoint) {
            self.host_id_to_endpoint.remove(&id);
        }
        self.endpoint_clocks.remove(&endpoint);
        self.bump();
    }

    /// `clone_async`: a cooperative clone that yields every few thousand
    /// elements so a large ring doesn't block a shard's task queue
    /// (spec.md §4.1, §5 "Suspension points").
    pub async fn clone_async(&self) -> Self {
        const YIELD_EVERY: usize = 4096;
        let mut out = self.clone();
        // `self.clone()` above is the actual copy; the loop below models
        // the cooperative-yield contract for callers that build a snapshot
        // incrementally from a very large ring (spec.md §5 `maybe_yield`).
        for (i, _) in out.normal_tokens.iter().enumerate() {
            if i % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        out.bump();
        out.ring_version -= 1; // clone_async must not itself look like a mutation
        out
    }

    /// `clone_after_all_left`: a snapshot with every leaving endpoint
    /// excised, used to decide whether a decommission is the last node
    /// standing (spec.md §4.1, SPEC_FULL.md §C.5).
    pub fn clone_after_all_left(&self) -> Self {
        let mut out = self.clone();
        let leaving: Vec<Endpoint> = out.leaving_endpoints.iter().copied().collect();
        for ep in leaving {
            out.remove_endpoint(ep);
        }
        out
    }

    /// SPEC_FULL.md §C.5: true if, once every currently-leaving endpoint is
    /// excised, fewer than 2 tokens would remain on the ring.
    pub fn would_be_last_node(&self) -> bool {
        self.clone_after_all_left().sorted_tokens().len() < 2
    }

    /// `update_pending_ranges(strategy, ks)` (spec.md §4.1). Recomputes,
    /// for one keyspace, the ranges this endpoint will gain or lose once
    /// every currently-announced topology change completes. The
    /// computation itself (which endpoint replicates which range) is
    /// delegated to the Local Database collaborator in the real system;
    /// here we compute directly from `bootstrap_tokens`/`leaving_endpoints`
    /// since that's the authoritative input named by spec.md, and the
    /// replication-factor fan-out is the only piece that depends on
    /// `ReplicationStrategy`.
    pub fn update_pending_ranges(
        &mut self,
        keyspace: &str,
        strategy: ReplicationStrategy,
        this_endpoint: Endpoint,
    ) {
        let sorted = self.sorted_tokens();
        let mut gaining = BTreeSet::new();
        let mut losing = BTreeSet::new();

        if !sorted.is_empty() {
            for (&token, &bootstrapping_ep) in &self.bootstrap_tokens {
                let owns_replica = self.would_replicate(token, bootstrapping_ep, &sorted, strategy);
                if bootstrapping_ep == this_endpoint && owns_replica {
                    if let Some(range) = self.predecessor_range(token, &sorted) {
                        gaining.insert(range);
                    }
                }
            }
            for &leaving_ep in &self.leaving_endpoints {
                for (&token, &owner) in &self.normal_tokens {
                    if owner == leaving_ep {
                        if let Some(range) = self.predecessor_range(token, &sorted) {
                            if leaving_ep == this_endpoint {
                                losing.insert(range);
                            } else if self.would_replicate(token, this_endpoint, &sorted, strategy) {
                                gaining.insert(range);
                            }
                        }
                    }
                }
            }
        }

        self.pending_ranges.insert(keyspace.to_string(), PendingRanges { gaining, losing });
        self.bump();
    }

    fn predecessor_range(&self, token: Token, sorted: &[Token]) -> Option<Range> {
        let idx = sorted.iter().position(|&t| t == token)?;
        let start = if idx == 0 { *sorted.last().unwrap() } else { sorted[idx - 1] };
        Some(Range { start, end: token })
    }

    /// Whether `candidate` would be among the `replication_factor` owners
    /// walking clockwise from `token`, a minimal stand-in for the real
    /// snitch-aware placement strategy (out of scope, spec.md §1).
    fn would_replicate(
        &self,
        token: Token,
        candidate: Endpoint,
        sorted: &[Token],
        strategy: ReplicationStrategy,
    ) -> bool {
        if sorted.is_empty() {
            return false;
        }
        let start = sorted.iter().position(|&t| t == token).unwrap_or(0);
        let mut seen = BTreeSet::new();
        for i in 0..sorted.len() {
            let t = sorted[(start + i) % sorted.len()];
            let owner = self
                .normal_tokens
                .get(&t)
                .copied()
                .or_else(|| self.bootstrap_tokens.get(&t).copied());
            if let Some(owner) = owner {
                if owner == candidate {
                    return true;
                }
                seen.insert(owner);
                if seen.len() >= strategy.replication_factor {
                    return false;
                }
            }
        }
        false
    }

    pub fn pending_ranges_for(&self, keyspace: &str) -> PendingRanges {
        self.pending_ranges.get(keyspace).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn ep(n: u8) -> Endpoint {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7000)
    }

    fn clock(v: u64) -> GossipClock {
        GossipClock { generation: 1, version: v }
    }

    #[test]
    fn update_normal_tokens_claims_unowned_tokens() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(10), Token(20)], ep(1), clock(1));
        assert_eq!(tm.normal_tokens.get(&Token(10)), Some(&ep(1)));
        assert_eq!(tm.sorted_tokens(), vec![Token(10), Token(20)]);
    }

    #[test]
    fn later_generation_wins_collision_and_loser_is_reported() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(10)], ep(1), clock(1));
        let losers = tm.update_normal_tokens(&[Token(10)], ep(2), clock(2));
        assert_eq!(tm.normal_tokens.get(&Token(10)), Some(&ep(2)));
        assert!(losers.contains(&ep(1)));
    }

    #[test]
    fn earlier_generation_does_not_displace_owner() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(10)], ep(1), clock(5));
        tm.update_normal_tokens(&[Token(10)], ep(2), clock(1));
        assert_eq!(tm.normal_tokens.get(&Token(10)), Some(&ep(1)));
    }

    #[test]
    fn add_then_remove_bootstrap_tokens_round_trips() {
        let mut tm = TokenMetadata::new();
        let before = tm.clone();
        tm.add_bootstrap_tokens(&[Token(1), Token(2)], ep(1));
        tm.remove_bootstrap_tokens(&[Token(1), Token(2)]);
        assert_eq!(tm.bootstrap_tokens, before.bootstrap_tokens);
        assert_eq!(tm.normal_tokens, before.normal_tokens);
    }

    #[test]
    fn add_then_del_leaving_endpoint_round_trips() {
        let mut tm = TokenMetadata::new();
        let before = tm.leaving_endpoints.clone();
        tm.add_leaving_endpoint(ep(1));
        tm.del_leaving_endpoint(ep(1));
        assert_eq!(tm.leaving_endpoints, before);
    }

    #[test]
    fn replacing_endpoint_requires_existing_to_own_tokens() {
        let mut tm = TokenMetadata::new();
        assert!(tm.add_replacing_endpoint(ep(1), ep(2)).is_err());
        tm.update_normal_tokens(&[Token(1)], ep(1), clock(1));
        assert!(tm.add_replacing_endpoint(ep(1), ep(2)).is_ok());
    }

    #[test]
    fn replacing_endpoint_rejects_replacement_that_already_owns_tokens() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(1)], ep(1), clock(1));
        tm.update_normal_tokens(&[Token(2)], ep(2), clock(1));
        assert!(tm.add_replacing_endpoint(ep(1), ep(2)).is_err());
    }

    #[test]
    fn host_id_collision_later_generation_wins() {
        let mut tm = TokenMetadata::new();
        tm.endpoint_clocks.insert(ep(1), clock(1));
        tm.update_host_id(ep(1), HostId(1), clock(1));
        tm.endpoint_clocks.insert(ep(2), clock(2));
        tm.update_host_id(ep(2), HostId(1), clock(2));
        assert_eq!(tm.endpoint_of_host_id(HostId(1)), Some(ep(2)));
        assert_eq!(tm.host_id_of(ep(1)), None);
    }

    #[test]
    fn remove_endpoint_clears_every_table() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(1)], ep(1), clock(1));
        tm.update_host_id(ep(1), HostId(9), clock(1));
        tm.add_leaving_endpoint(ep(1));
        tm.remove_endpoint(ep(1));
        assert!(tm.normal_tokens.is_empty());
        assert!(tm.leaving_endpoints.is_empty());
        assert_eq!(tm.host_id_of(ep(1)), None);
    }

    #[test]
    fn would_be_last_node_detects_final_decommission() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(1)], ep(1), clock(1));
        tm.update_normal_tokens(&[Token(2)], ep(2), clock(1));
        tm.add_leaving_endpoint(ep(1));
        assert!(tm.would_be_last_node());
    }

    #[tokio::test]
    async fn clone_async_does_not_bump_ring_version() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens(&[Token(1)], ep(1), clock(1));
        let before = tm.ring_version;
        let snap = tm.clone_async().await;
        assert_eq!(snap.ring_version, before);
    }
}
