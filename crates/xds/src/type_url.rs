//! Type URLs for the resources the mock control plane serves.

use std::fmt;

/// Type URL wrapper for xDS resource types.
///
/// ```rust
/// use e2e_xds::TypeUrl;
///
/// let listener = TypeUrl::new(TypeUrl::LISTENER);
/// assert_eq!(listener.message_name(), "envoy.config.listener.v3.Listener");
/// assert_eq!(listener.short_name(), "Listener");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeUrl(String);

impl TypeUrl {
    /// Type URL prefix shared by all protobuf `Any` payloads.
    pub const PREFIX: &'static str = "type.googleapis.com/";

    /// Type URL for Listener (LDS).
    pub const LISTENER: &'static str = "type.googleapis.com/envoy.config.listener.v3.Listener";

    /// Type URL for Cluster (CDS).
    pub const CLUSTER: &'static str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    /// Create a new type URL from a string.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Build a type URL from a fully qualified message name.
    #[must_use]
    pub fn from_message_name(name: &str) -> Self {
        Self(format!("{}{}", Self::PREFIX, name))
    }

    /// Get the type URL as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified message name, without the `type.googleapis.com/` prefix.
    pub fn message_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }

    /// Unqualified message name, e.g. `Cluster`.
    pub fn short_name(&self) -> &str {
        let name = self.message_name();
        name.rsplit_once('.').map_or(name, |(_, short)| short)
    }
}

impl fmt::Display for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeUrl {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TypeUrl {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TypeUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_names() {
        let url = TypeUrl::new(TypeUrl::CLUSTER);
        assert_eq!(url.message_name(), "envoy.config.cluster.v3.Cluster");
        assert_eq!(url.short_name(), "Cluster");
    }

    #[test]
    fn from_message_name_round_trips() {
        let url = TypeUrl::from_message_name("envoy.config.listener.v3.Listener");
        assert_eq!(url.as_str(), TypeUrl::LISTENER);
    }
}
