//! Shared scenario state and template rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use e2e_xds::{ResourceParser, SnapshotCache};
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;

use crate::config::DriverConfig;
use crate::{Error, Result};

/// First port handed out to test index 0.
pub const BASE_PORT: u16 = 20000;

/// Ports reserved per test index.
pub const PORT_STRIDE: u16 = 20;

/// Ports used by one test.
///
/// Ports derive from the test index alone, so tests with different indices
/// run in parallel without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ports {
    /// Mock control plane.
    pub xds: u16,
    /// HTTP backend.
    pub backend: u16,
    /// TCP echo backend.
    pub tcp_backend: u16,
    /// Client proxy admin.
    pub client_admin: u16,
    /// Client proxy listener.
    pub client: u16,
    /// Server proxy admin.
    pub server_admin: u16,
    /// Server proxy listener.
    pub server: u16,
    /// Server proxy tunnel listener.
    pub server_tunnel: u16,
    /// Stackdriver fake.
    pub sd: u16,
    /// Secure token service fake.
    pub sts: u16,
    /// OpenTelemetry collector fake.
    pub otel: u16,
}

impl Ports {
    /// Ports for test `index`.
    pub fn for_test(index: u16) -> Self {
        let base = BASE_PORT + index * PORT_STRIDE;
        Self {
            xds: base,
            backend: base + 1,
            tcp_backend: base + 2,
            client_admin: base + 3,
            client: base + 4,
            server_admin: base + 5,
            server: base + 6,
            server_tunnel: base + 7,
            sd: base + 8,
            sts: base + 9,
            otel: base + 10,
        }
    }
}

/// Control plane handle published by the `Xds` step.
#[derive(Debug, Clone)]
pub struct XdsHandle {
    /// Snapshot cache the server reads from.
    pub cache: Arc<SnapshotCache>,
    /// Parser for Listener and Cluster YAML, if an Envoy API descriptor set
    /// is available.
    pub parser: Option<Arc<ResourceParser>>,
}

/// State shared by every step of a scenario.
///
/// Cloning shares the variable store, so both sides of a fork see each
/// other's writes. Concurrent writers must use distinct keys.
#[derive(Debug, Clone)]
pub struct Params {
    /// Allocated ports.
    pub ports: Ports,
    /// Current iteration of the innermost `Repeat`.
    pub n: usize,
    vars: Arc<DashMap<String, String>>,
    xds: Option<XdsHandle>,
}

impl Params {
    /// Fresh state for test `index`.
    pub fn new(index: u16) -> Self {
        Self {
            ports: Ports::for_test(index),
            n: 0,
            vars: Arc::default(),
            xds: None,
        }
    }

    /// Seed variables.
    pub fn with_vars<K, V>(self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.vars.insert(key.into(), value.into());
        }
        self
    }

    /// Set a variable.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Read a variable.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(|v| v.value().clone())
    }

    /// Snapshot of all variables.
    pub fn vars(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// The running control plane, if any.
    pub fn xds(&self) -> Option<&XdsHandle> {
        self.xds.as_ref()
    }

    pub(crate) fn set_xds(&mut self, handle: Option<XdsHandle>) {
        self.xds = handle;
    }

    /// Render `template` against these params.
    ///
    /// The context exposes `vars`, `ports` and `n`. Undefined names render
    /// empty. The `fill` filter renders a value as a template itself, so a
    /// variable may hold a template: `{{ vars.ClientMetadata | fill }}`.
    pub fn fill(&self, template: &str) -> Result<String> {
        self.render(template, None)
    }

    /// Like [`fill`](Self::fill) with an extra `bootstrap` object in scope.
    pub fn fill_with(&self, template: &str, extra: Value) -> Result<String> {
        self.render(template, Some(extra))
    }

    fn render(&self, template: &str, extra: Option<Value>) -> Result<String> {
        let mut ctx: BTreeMap<&str, Value> = BTreeMap::new();
        ctx.insert("vars", Value::from_serialize(self.vars()));
        ctx.insert("ports", Value::from_serialize(self.ports));
        ctx.insert("n", Value::from(self.n));
        if let Some(extra) = extra {
            ctx.insert("bootstrap", extra);
        }
        let ctx = Value::from_serialize(&ctx);

        let mut env = environment();
        let inner = ctx.clone();
        env.add_filter("fill", move |value: String| environment().render_str(&value, &inner));
        Ok(env.render_str(template, &ctx)?)
    }

    /// Read a fixture under the testdata root and render it.
    pub fn load_test_data(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = testdata_path(path);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        self.fill(&raw)
    }
}

/// Resolve a fixture path against the configured testdata root.
///
/// Absolute paths are returned unchanged.
pub fn testdata_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        DriverConfig::global().testdata().join(path)
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_keep_trailing_newline(true);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ports_are_disjoint_across_tests() {
        let a = Ports::for_test(0);
        let b = Ports::for_test(1);
        assert_eq!(a.xds, BASE_PORT);
        assert_eq!(b.xds, BASE_PORT + PORT_STRIDE);
        assert!(a.otel < b.xds);
    }

    #[test]
    fn fill_renders_vars_ports_and_n() {
        let mut params = Params::new(2).with_vars([("NodeID", "client")]);
        params.n = 3;
        let out = params
            .fill("{{ vars.NodeID }}:{{ ports.xds }}:{{ n }}")
            .unwrap();
        assert_eq!(out, format!("client:{}:3", BASE_PORT + 2 * PORT_STRIDE));
    }

    #[test]
    fn undefined_renders_empty() {
        let params = Params::new(0);
        assert_eq!(params.fill("[{{ vars.Missing }}]").unwrap(), "[]");
    }

    #[test]
    fn fill_filter_renders_nested_template() {
        let params = Params::new(0).with_vars([
            ("Cluster", "backend"),
            ("Meta", "cluster: {{ vars.Cluster }}"),
        ]);
        assert_eq!(
            params.fill("{{ vars.Meta | fill }}").unwrap(),
            "cluster: backend"
        );
    }

    #[test]
    fn fill_with_exposes_bootstrap() {
        let params = Params::new(0);
        let out = params
            .fill_with(
                "{{ bootstrap.node }}",
                minijinja::context! { node => "server" },
            )
            .unwrap();
        assert_eq!(out, "server");
    }

    #[test]
    fn syntax_error_is_template_error() {
        let err = Params::new(0).fill("{{ vars.").unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn clones_share_vars() {
        let params = Params::new(0);
        let fork = params.clone();
        fork.set("Written", "by-fork");
        assert_eq!(params.get("Written").as_deref(), Some("by-fork"));
    }

    #[test]
    fn missing_fixture_names_path() {
        let err = Params::new(0).load_test_data("/nonexistent/fixture.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fixture.yaml"));
    }
}
