//! # e2e-proto
//!
//! Generated protobuf types for the end-to-end test driver.
//!
//! This crate carries trimmed copies of the protos the driver speaks:
//!
//! - Aggregated discovery (`envoy.service.discovery.v3`) for the mock control plane
//! - Cloud Monitoring v3, Cloud Logging v2 and Cloud Trace v1/v2 for the fake telemetry backends
//! - Support types from `google.api` and `google.rpc`
//!
//! Only fields and RPCs exercised by the proxy's exporters are declared; unknown fields on the
//! wire are skipped by prost.
//!
//! Golden fixtures are written in protobuf text format and loaded through [`golden`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::large_enum_variant, clippy::doc_lazy_continuation)]

pub mod golden;

pub use golden::GoldenError;
pub use prost::Message;
pub use prost_types::Any;

include!(concat!(env!("OUT_DIR"), "/mod.rs"));

/// Serialized `FileDescriptorSet` covering every message in this crate.
pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/e2e_descriptor.bin"));

/// Short paths to the generated modules.
pub mod prelude {
    pub use crate::envoy::config::core::v3::{ControlPlane, Node};
    pub use crate::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
    pub use crate::google::api::metric_descriptor::{MetricKind, ValueType};
    pub use crate::google::api::{Distribution, Metric, MonitoredResource};
    pub use crate::google::devtools::cloudtrace::v1 as trace_v1;
    pub use crate::google::devtools::cloudtrace::v2 as trace_v2;
    pub use crate::google::logging::v2 as logging_v2;
    pub use crate::google::monitoring::v3 as monitoring_v3;
}
