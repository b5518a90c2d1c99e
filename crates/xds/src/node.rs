//! Node identification for the snapshot cache.
//!
//! Envoy instances are addressed by the `id` field of their bootstrap `node`
//! section. The cache keys snapshots by an FNV-1a hash of that ID.

use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;

/// Hash of an Envoy node ID.
///
/// ```rust
/// use e2e_xds::NodeHash;
///
/// assert_eq!(NodeHash::from_id("client"), NodeHash::from_id("client"));
/// assert_ne!(NodeHash::from_id("client"), NodeHash::from_id("server"));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHash(u64);

impl NodeHash {
    /// Hash a node ID.
    #[must_use]
    pub fn from_id(node_id: &str) -> Self {
        let mut hasher = FnvHasher::default();
        node_id.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Get the raw hash value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<&str> for NodeHash {
    fn from(node_id: &str) -> Self {
        Self::from_id(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_fixed_width_hex() {
        let hash = NodeHash::from_id("client");
        let shown = hash.to_string();
        assert_eq!(shown.len(), 16);
        assert_eq!(u64::from_str_radix(&shown, 16).unwrap(), hash.as_u64());
    }

    #[test]
    fn from_str_matches_from_id() {
        assert_eq!(NodeHash::from("server"), NodeHash::from_id("server"));
    }
}
