//! # e2e-fakes
//!
//! Fake telemetry backends used as test oracles.
//!
//! - [`FakeStackdriver`] - Cloud Monitoring v3, Cloud Logging v2 and Cloud
//!   Trace v1/v2 on one gRPC port, with optional TLS and bearer checks
//! - [`OtelCollector`] - inert OTLP logs and metrics collector
//! - [`SecureTokenService`] - HTTP token-exchange emulator
//!
//! Metric and log writes are funneled through a single channel into an
//! [`Aggregator`], which keeps canonical (volatile-field-free) forms that
//! assertions compare against golden fixtures.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
mod auth;
mod error;
mod logging;
mod metrics;
mod otel;
pub mod serve;
mod stackdriver;
pub mod sts;
mod tls;
pub mod trace;

pub use aggregate::{Aggregator, Consumer, Ingest};
pub use auth::{BearerAuth, EXPECTED_BEARER, EXPECTED_PROJECT, PROJECT_HEADER};
pub use error::{FakeError, Result};
pub use logging::{merge_request_fields, LoggingServer};
pub use metrics::MetricServer;
pub use otel::OtelCollector;
pub use serve::FakeServer;
pub use stackdriver::{FakeStackdriver, StackdriverBuilder, StackdriverState};
pub use sts::SecureTokenService;
pub use tls::TlsFiles;
pub use trace::TraceServer;
