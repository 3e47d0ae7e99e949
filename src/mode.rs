//! Mode State Machine (C2, spec.md §4.2).
//!
//! Shaped after the teacher's `PeerState` enum (`ec_peers.rs`): a small
//! copyable enum with `is_x()` predicate helpers, plus here an explicit
//! transition table since the mode machine (unlike `PeerState`) has a
//! single authoritative current value rather than one per peer.

use crate::error::{CoordinatorError, Result};
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Starting,
    Joining,
    Normal,
    Leaving,
    Draining,
    Drained,
    Decommissioned,
}

impl Mode {
    /// Integer coding for the `node.operation_mode` gauge (spec.md §6).
    pub fn metric_code(&self) -> i64 {
        match self {
            Mode::Starting => 1,
            Mode::Joining => 2,
            Mode::Normal => 3,
            Mode::Leaving => 4,
            Mode::Decommissioned => 5,
            Mode::Draining => 6,
            Mode::Drained => 7,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Mode::Normal)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Mode::Decommissioned | Mode::Drained)
    }

    fn can_transition_to(&self, next: Mode) -> bool {
        use Mode::*;
        matches!(
            (self, next),
            (Starting, Joining)
                | (Joining, Normal)
                | (Normal, Leaving)
                | (Leaving, Decommissioned)
                | (Starting, Draining)
                | (Joining, Draining)
                | (Normal, Draining)
                | (Leaving, Draining)
                | (Draining, Drained)
        )
    }
}

/// The node's lifecycle mode, observable on all shards (driven by C6, the
/// Metadata Replicator). `ModeState` itself is the shard-local cell; the
/// replicator is responsible for fanning a change to every shard.
pub struct ModeState {
    current: Mode,
}

impl ModeState {
    pub fn new() -> Self {
        Self { current: Mode::Starting }
    }

    pub fn current(&self) -> Mode {
        self.current
    }

    /// Transition to `next`, logging the change. Fails if `next` is not a
    /// legal transition from the current mode (spec.md §4.2's transition
    /// table is exhaustive; anything else is a programming error in a
    /// caller, not a runtime condition, but we still return an error rather
    /// than panic so callers driven by untrusted peer input can't crash the
    /// process).
    pub fn transition(&mut self, next: Mode) -> Result<()> {
        if !self.current.can_transition_to(next) {
            return Err(CoordinatorError::Fatal(format!(
                "illegal mode transition {:?} -> {:?}",
                self.current, next
            )));
        }
        info!("mode {:?} -> {:?}", self.current, next);
        self.current = next;
        Ok(())
    }
}

impl Default for ModeState {
    fn default() -> Self {
        Self::new()
    }
}
