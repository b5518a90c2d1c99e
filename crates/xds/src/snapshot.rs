//! Snapshot: immutable, versioned set of resources for one node.
//!
//! Publishing a snapshot replaces whatever the node had before. Resources
//! of a type missing from the new snapshot are not carried over.

use std::collections::{BTreeMap, HashMap};

use crate::{Resource, TypeUrl};

/// Resources of one type within a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotResources {
    version: String,
    resources: BTreeMap<String, Resource>,
}

impl SnapshotResources {
    /// Create an empty resource collection.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Version for this resource type.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of resources.
    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether there are no resources.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Get a resource by name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Resource names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Resources in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }
}

/// An immutable snapshot of xDS resources for a node.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: String,
    resources: HashMap<TypeUrl, SnapshotResources>,
}

impl Snapshot {
    /// Create a new snapshot builder.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    /// Global version of this snapshot.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resources for a specific type.
    #[inline]
    pub fn get_resources(&self, type_url: &TypeUrl) -> Option<&SnapshotResources> {
        self.resources.get(type_url)
    }

    /// Version for a specific resource type.
    #[inline]
    pub fn get_version(&self, type_url: &TypeUrl) -> Option<&str> {
        self.resources.get(type_url).map(|r| r.version.as_str())
    }

    /// All type URLs present in this snapshot.
    pub fn type_urls(&self) -> impl Iterator<Item = &TypeUrl> {
        self.resources.keys()
    }

    /// Total number of resources across all types.
    pub fn total_resources(&self) -> usize {
        self.resources.values().map(SnapshotResources::len).sum()
    }
}

/// Builder for creating snapshots.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    version: String,
    resources: HashMap<TypeUrl, SnapshotResources>,
}

impl SnapshotBuilder {
    /// Create a new snapshot builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global version for this snapshot.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add resources of a type at the global version.
    ///
    /// The type is registered even when `resources` is empty, so a subscriber
    /// for it gets an empty response instead of waiting.
    pub fn resources(
        mut self,
        type_url: impl Into<TypeUrl>,
        resources: impl IntoIterator<Item = Resource>,
    ) -> Self {
        let entry = self
            .resources
            .entry(type_url.into())
            .or_insert_with(|| SnapshotResources::new(self.version.clone()));
        for resource in resources {
            entry.resources.insert(resource.name().to_string(), resource);
        }
        self
    }

    /// Build the snapshot.
    pub fn build(self) -> Snapshot {
        Snapshot {
            version: self.version,
            resources: self.resources,
        }
    }
}
