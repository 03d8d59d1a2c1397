//! Event kinds used by the federation.

/// Torrent announcement
pub const TORRENT: u32 = 2003;

/// Torrent comment
pub const TORRENT_COMMENT: u32 = 2004;

/// Relay announcement (discovery)
pub const RELAY_ANNOUNCEMENT: u32 = 30166;

/// Trust policy
pub const TRUST_POLICY: u32 = 30173;

/// Curator decision
pub const CURATOR_DECISION: u32 = 30175;

/// Kinds belonging to the torrent federation itself.
pub const FEDERATION_KINDS: [u32; 5] = [
    TORRENT,
    TORRENT_COMMENT,
    RELAY_ANNOUNCEMENT,
    TRUST_POLICY,
    CURATOR_DECISION,
];

/// True for kinds the federation defines.
pub fn is_federation_kind(kind: u32) -> bool {
    FEDERATION_KINDS.contains(&kind)
}
