//! Control plane steps.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use e2e_xds::{Cache, NodeHash, Resource, ResourceParser, Snapshot, SnapshotCache, TypeUrl, XdsServer};
use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::params::XdsHandle;
use crate::scenario::Step;
use crate::{Error, Params, Result};

static ENVOY_PARSER: OnceCell<Option<Arc<ResourceParser>>> = OnceCell::new();

/// Parser over the configured Envoy API descriptor set, loaded once.
fn configured_parser() -> Result<Option<Arc<ResourceParser>>> {
    ENVOY_PARSER
        .get_or_try_init(|| -> Result<_> {
            match DriverConfig::global().descriptor_set() {
                Some(path) => Ok(Some(Arc::new(ResourceParser::from_file(path)?))),
                None => Ok(None),
            }
        })
        .cloned()
}

/// Start the mock ADS server on `ports.xds` and publish its cache.
#[derive(Debug, Default)]
pub struct Xds {
    parser: Option<Arc<ResourceParser>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<e2e_xds::XdsResult<()>>>,
}

impl Xds {
    /// Create the step. Resources are parsed with the descriptor set from
    /// `ENVOY_DESCRIPTOR_SET`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse resources with `parser` instead of the configured descriptor set.
    pub fn with_parser(parser: ResourceParser) -> Self {
        Self {
            parser: Some(Arc::new(parser)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Step for Xds {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let parser = match &self.parser {
            Some(parser) => Some(Arc::clone(parser)),
            None => configured_parser()?,
        };
        if parser.is_none() {
            warn!(
                "{} is not set, Update steps will fail",
                crate::config::ENVOY_DESCRIPTOR_SET
            );
        }

        let port = params.ports.xds;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| Error::io(format!("failed to bind xDS port {port}"), e))?;

        let cache = Arc::new(SnapshotCache::new());
        let server = XdsServer::builder().cache(Arc::clone(&cache)).build()?;
        let (tx, rx) = oneshot::channel::<()>();
        self.task = Some(tokio::spawn(server.serve_with_shutdown(listener, async {
            let _ = rx.await;
        })));
        self.shutdown = Some(tx);

        params.set_xds(Some(XdsHandle { cache, parser }));
        info!(port, "xDS server started");
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "xDS server exited with error"),
                Ok(Err(e)) => warn!(error = %e, "xDS server task failed"),
                Err(_) => warn!("xDS server did not stop in time"),
            }
        }
    }
}

/// Publish a new snapshot for one node.
///
/// Every string is a template rendered against the params. The snapshot
/// replaces whatever the node had before; always both resource types are
/// published, possibly empty.
#[derive(Debug, Clone, Default)]
pub struct Update {
    /// Node id the snapshot is for.
    pub node: String,
    /// Snapshot version.
    pub version: String,
    /// Cluster YAML documents.
    pub clusters: Vec<String>,
    /// Listener YAML documents.
    pub listeners: Vec<String>,
}

impl Update {
    /// Create an update for `node` at `version`.
    pub fn new(node: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Add a cluster template.
    pub fn cluster(mut self, yaml: impl Into<String>) -> Self {
        self.clusters.push(yaml.into());
        self
    }

    /// Add a listener template.
    pub fn listener(mut self, yaml: impl Into<String>) -> Self {
        self.listeners.push(yaml.into());
        self
    }

    fn parse_all(
        params: &Params,
        parser: &ResourceParser,
        type_url: &TypeUrl,
        templates: &[String],
    ) -> Result<Vec<Resource>> {
        templates
            .iter()
            .map(|template| {
                let yaml = params.fill(template)?;
                Ok(parser.parse_yaml(type_url, &yaml)?)
            })
            .collect()
    }
}

#[async_trait]
impl Step for Update {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let handle = params
            .xds()
            .ok_or(Error::NotStarted("Update requires a running Xds step"))?;
        let parser = handle.parser.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "set {} to parse Envoy resources",
                crate::config::ENVOY_DESCRIPTOR_SET
            ))
        })?;

        let node = params.fill(&self.node)?;
        let version = params.fill(&self.version)?;
        let clusters = Self::parse_all(params, parser, &TypeUrl::new(TypeUrl::CLUSTER), &self.clusters)?;
        let listeners =
            Self::parse_all(params, parser, &TypeUrl::new(TypeUrl::LISTENER), &self.listeners)?;

        info!(
            node = %node,
            version = %version,
            clusters = clusters.len(),
            listeners = listeners.len(),
            "publishing snapshot"
        );
        let snapshot = Snapshot::builder()
            .version(version)
            .resources(TypeUrl::CLUSTER, clusters)
            .resources(TypeUrl::LISTENER, listeners)
            .build();
        handle.cache.set_snapshot(NodeHash::from_id(&node), snapshot);
        Ok(())
    }
}
