//! Driver settings read from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::info;

/// Proxy binary override.
pub const ENVOY_PATH: &str = "ENVOY_PATH";
/// Proxy log level override.
pub const ENVOY_DEBUG: &str = "ENVOY_DEBUG";
/// Descriptor set with the Envoy API, used to parse Listener and Cluster YAML.
pub const ENVOY_DESCRIPTOR_SET: &str = "ENVOY_DESCRIPTOR_SET";
/// Root of fixture files.
pub const E2E_TESTDATA: &str = "E2E_TESTDATA";

const LATENCY_BOUND: Duration = Duration::from_secs(1);
const SANITIZED_LATENCY_BOUND: Duration = Duration::from_secs(10);

/// Fixture root used when `E2E_TESTDATA` is unset.
pub const DEFAULT_TESTDATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata");

static GLOBAL: Lazy<DriverConfig> = Lazy::new(DriverConfig::from_env);

/// Settings shared by every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    envoy_path: PathBuf,
    envoy_log_level: String,
    tsan: bool,
    asan: bool,
    descriptor_set: Option<PathBuf>,
    testdata: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl DriverConfig {
    /// The process-wide configuration, read once.
    pub fn global() -> &'static DriverConfig {
        &GLOBAL
    }

    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            envoy_path: get(ENVOY_PATH).map(PathBuf::from).unwrap_or_else(|| "envoy".into()),
            envoy_log_level: get(ENVOY_DEBUG).unwrap_or_else(|| "info".into()),
            tsan: get("TSAN").is_some(),
            asan: get("ASAN").is_some(),
            descriptor_set: get(ENVOY_DESCRIPTOR_SET).map(PathBuf::from),
            testdata: get(E2E_TESTDATA)
                .map(PathBuf::from)
                .unwrap_or_else(|| DEFAULT_TESTDATA.into()),
        }
    }

    /// Proxy binary.
    pub fn envoy_path(&self) -> &Path {
        &self.envoy_path
    }

    /// Proxy log level.
    pub fn envoy_log_level(&self) -> &str {
        &self.envoy_log_level
    }

    /// Envoy API descriptor set, if configured.
    pub fn descriptor_set(&self) -> Option<&Path> {
        self.descriptor_set.as_deref()
    }

    /// Root of fixture files.
    pub fn testdata(&self) -> &Path {
        &self.testdata
    }

    /// Whether the proxy runs under a sanitizer.
    ///
    /// Sanitized builds are slow: latency thresholds are loosened and
    /// known-flaky scenarios are skipped.
    pub fn sanitized(&self) -> bool {
        self.tsan || self.asan
    }

    /// Returns `true` when a scenario known to be flaky under a sanitizer
    /// should be skipped, logging `reason`.
    ///
    /// ```rust,ignore
    /// if DriverConfig::global().skip_if_sanitized("timing-sensitive") {
    ///     return;
    /// }
    /// ```
    pub fn skip_if_sanitized(&self, reason: &str) -> bool {
        if self.sanitized() {
            info!(tsan = self.tsan, asan = self.asan, reason, "skipping under sanitizer");
            return true;
        }
        false
    }

    /// Upper bound for request latencies reported by the proxy.
    pub fn latency_bound(&self) -> Duration {
        if self.sanitized() {
            SANITIZED_LATENCY_BOUND
        } else {
            LATENCY_BOUND
        }
    }
}
