//! # envoye2e
//!
//! Scenario driver for end-to-end tests of an Envoy proxy.
//!
//! A test builds a [`Scenario`] out of [`Step`]s that share one [`Params`]:
//! a mock control plane ([`Xds`], [`Update`]), proxy processes ([`Envoy`]),
//! backends ([`Backend`], [`TcpServer`]), fake telemetry sinks
//! ([`Stackdriver`], [`Otel`], [`SecureTokenService`]) and assertions
//! ([`Get`], [`Stats`], [`Check`]). Steps run in order; everything a step
//! started is torn down in reverse order when the scenario ends, including
//! when a later step fails.
//!
//! ## Example
//!
//! ```rust,ignore
//! use envoye2e::{Backend, Envoy, Get, Params, Scenario, Update, Xds, BACKEND_BODY};
//!
//! let mut params = Params::new(0);
//! Scenario::new()
//!     .step(Xds::new())
//!     .step(Backend::new())
//!     .step(Update::new("client", "1").listener(CLIENT_LISTENER).cluster(CLIENT_CLUSTER))
//!     .step(Envoy::client())
//!     .step(Get::get("/").expect_body(BACKEND_BODY))
//!     .execute(&mut params)
//!     .await?;
//! ```
//!
//! ## Environment
//!
//! | Variable | Effect |
//! |---|---|
//! | `ENVOY_PATH` | Proxy binary, `envoy` on `PATH` by default |
//! | `ENVOY_DEBUG` | Proxy log level, `info` by default |
//! | `ENVOY_DESCRIPTOR_SET` | Serialized `FileDescriptorSet` with the Envoy v3 API. [`Update`] needs it to turn listener and cluster YAML into protos |
//! | `E2E_TESTDATA` | Fixture root, the workspace `testdata/` by default |
//! | `TSAN`, `ASAN` | Sanitized proxy: latency bounds are loosened and flaky scenarios skip themselves |
//!
//! A descriptor set can be produced from a checkout of the Envoy API:
//!
//! ```bash
//! protoc --include_imports --descriptor_set_out=envoy.pb -I api -I <deps> \
//!     envoy/config/listener/v3/listener.proto envoy/config/cluster/v3/cluster.proto
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod config;
mod envoy;
mod error;
mod http;
mod logging;
mod otel;
mod params;
mod scenario;
mod stackdriver;
pub mod stats;
mod sts;
mod tcp;
mod xds;

pub use backend::{Backend, BACKEND_BODY};
pub use config::DriverConfig;
pub use envoy::{admin_port, Envoy, DEFAULT_BOOTSTRAP};
pub use error::{Error, Result};
pub use http::{Get, HeaderExpectation, HttpCall};
pub use logging::init_tracing;
pub use otel::Otel;
pub use params::{testdata_path, Params, Ports, XdsHandle, BASE_PORT, PORT_STRIDE};
pub use scenario::{Fork, Repeat, Repetition, Scenario, Sleep, Step, StepFn};
pub use stackdriver::{Check, CheckTraces, ResetStackdriver, Stackdriver, StackdriverHandle};
pub use stats::{ExactStat, JsonStat, MissingStat, PartialStat, StatMatcher, Stats, StatsFormat};
pub use sts::SecureTokenService;
pub use tcp::{TcpConnection, TcpServer, TCP_PREFIX};
pub use xds::{Update, Xds};
