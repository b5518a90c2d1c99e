//! Envoy end-to-end scenarios
//!
//! These scenarios launch real proxy processes against the mock control
//! plane and fakes from `envoye2e`.
//!
//! ## Prerequisites
//!
//! 1. An Envoy binary on `PATH`, or `ENVOY_PATH` pointing at one
//! 2. `ENVOY_DESCRIPTOR_SET` pointing at a serialized `FileDescriptorSet`
//!    with the Envoy v3 API, used to parse the listener and cluster YAML
//! 3. Ports `20000` upward free on loopback
//!
//! ## Running Tests
//!
//! ```bash
//! ENVOY_PATH=/usr/local/bin/envoy ENVOY_DESCRIPTOR_SET=envoy.pb \
//!     cargo test --package envoy-tests -- --ignored
//! ```

pub mod harness;

#[cfg(test)]
mod tests;
