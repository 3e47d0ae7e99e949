//! Core data-model types shared by every component (spec.md §3).

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

/// An opaque ordered value on the ring. Typically a 64-bit murmur3 hash in
/// production; the hash function itself is out of scope here (spec.md §1
/// Non-goals), so tokens are accepted as already-hashed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Network address identifying one peer node.
pub type Endpoint = SocketAddr;

/// 128-bit identifier that survives IP changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct HostId(pub u128);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Opaque CDC generation identifier. The math that produces one is out of
/// scope (spec.md §1 Non-goals / SPEC_FULL.md §C.3); it is threaded through
/// exactly where the protocol requires it to be announced atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CdcGenerationId(pub u64);

/// Gossip's (generation, version) vector-clock pair. Generation increments
/// once per process restart; version increments per local application-state
/// write. Total order on this pair is the tie-break authority for token and
/// host-id collisions (spec.md §4.1, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GossipClock {
    pub generation: u64,
    pub version: u64,
}

impl PartialOrd for GossipClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GossipClock {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.version).cmp(&(other.generation, other.version))
    }
}

/// One of the gossip application-state keys this coordinator consumes or
/// produces (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    Status,
    Tokens,
    HostId,
    RpcAddress,
    ReleaseVersion,
    SupportedFeatures,
    Schema,
    Dc,
    Rack,
    CdcGenerationId,
    RemovalCoordinator,
    NetVersion,
    SchemaTablesVersion,
    RpcReady,
    SnitchName,
    ShardCount,
    IgnoreMsbBits,
    CacheHitrates,
    ViewBacklog,
}

/// The parsed first field of a STATUS application-state value
/// (spec.md §4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusValue {
    Boot,
    Normal,
    Shutdown,
    Removing,
    Removed,
    Leaving,
    Left,
    Moving,
    Hibernate,
}

impl StatusValue {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "BOOT" => Some(Self::Boot),
            "NORMAL" => Some(Self::Normal),
            "SHUTDOWN" => Some(Self::Shutdown),
            "REMOVING_TOKEN" | "REMOVING" => Some(Self::Removing),
            "REMOVED_TOKEN" | "REMOVED" => Some(Self::Removed),
            "LEAVING" => Some(Self::Leaving),
            "LEFT" => Some(Self::Left),
            "MOVING" => Some(Self::Moving),
            "HIBERNATE" => Some(Self::Hibernate),
            _ => None,
        }
    }
}

/// A comma-delimited STATUS value split into its tag and remaining pieces
/// (spec.md §4.3, §6: "first field is the state name; subsequent fields
/// encode tokens or expire-time").
#[derive(Debug, Clone)]
pub struct StatusPieces {
    pub tag: StatusValue,
    pub pieces: Vec<String>,
}

impl StatusPieces {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',');
        let tag = StatusValue::parse(parts.next()?)?;
        let pieces = parts.map(str::to_owned).collect();
        Some(Self { tag, pieces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_clock_orders_by_generation_then_version() {
        let a = GossipClock { generation: 1, version: 5 };
        let b = GossipClock { generation: 1, version: 6 };
        let c = GossipClock { generation: 2, version: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn status_pieces_parses_tag_and_pieces() {
        let parsed = StatusPieces::parse("LEFT,123456,789").unwrap();
        assert_eq!(parsed.tag, StatusValue::Left);
        assert_eq!(parsed.pieces, vec!["123456".to_string(), "789".to_string()]);
    }

    #[test]
    fn status_pieces_rejects_unknown_tag() {
        assert!(StatusPieces::parse("UNKNOWN_STATE,1").is_none());
    }
}
