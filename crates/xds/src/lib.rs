//! # e2e-xds
//!
//! A miniature aggregated discovery (ADS) control plane for driving Envoy in
//! end-to-end tests.
//!
//! - [`SnapshotCache`] - latest [`Snapshot`] per node, with watches
//! - [`ResourceParser`] - YAML to protobuf `Any` via a runtime descriptor pool
//! - [`XdsServer`] - State-of-the-World ADS over gRPC
//!
//! Publishing a snapshot for a node supersedes the previous one. Open
//! streams for that node receive the new resources on their next open
//! request; there is no separate push API.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use e2e_xds::{Cache, NodeHash, Snapshot, SnapshotCache, TypeUrl, XdsServer};
//!
//! let cache = Arc::new(SnapshotCache::new());
//! let server = XdsServer::builder().cache(Arc::clone(&cache)).build()?;
//! tokio::spawn(server.serve("127.0.0.1:18000".parse()?, shutdown));
//!
//! cache.set_snapshot(
//!     NodeHash::from_id("client"),
//!     Snapshot::builder().version("1").resources(TypeUrl::CLUSTER, clusters).build(),
//! );
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ads;
mod cache;
mod error;
mod node;
mod resource;
mod server;
mod snapshot;
mod sotw;
mod stream;
mod type_url;
mod watch;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use ads::AdsService;
pub use cache::{Cache, SnapshotCache};
pub use error::XdsError;
pub use node::NodeHash;
pub use resource::{Resource, ResourceParser};
pub use server::{XdsServer, XdsServerBuilder};
pub use snapshot::{Snapshot, SnapshotBuilder, SnapshotResources};
pub use sotw::{SotwHandler, CONTROL_PLANE_ID};
pub use stream::{StreamContext, StreamId};
pub use type_url::TypeUrl;
pub use watch::{Watch, WatchId, WatchManager};

/// Result type alias using [`XdsError`].
pub type XdsResult<T> = std::result::Result<T, XdsError>;
