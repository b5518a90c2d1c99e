//! Mock control-plane server lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::ads::AdsService;
use crate::{SnapshotCache, XdsError, XdsResult};

/// Aggregated discovery server over a shared [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct XdsServer {
    cache: Arc<SnapshotCache>,
    response_buffer_size: usize,
}

impl XdsServer {
    /// Create a new builder for configuring the server.
    pub fn builder() -> XdsServerBuilder {
        XdsServerBuilder::default()
    }

    /// The cache backing the server.
    #[inline]
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    ///
    /// Binding up front lets callers report port conflicts before any
    /// background task is spawned.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> XdsResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| XdsError::transport("listener has no local address", e))?;
        let service = AdsService::new(self.cache, self.response_buffer_size);

        info!(addr = %addr, "xDS server listening");
        Server::builder()
            .add_service(service.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await
            .map_err(|e| XdsError::transport(format!("xDS server on {addr} failed"), e))?;
        info!(addr = %addr, "xDS server stopped");
        Ok(())
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> XdsResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| XdsError::transport(format!("failed to bind {addr}"), e))?;
        self.serve_with_shutdown(listener, shutdown).await
    }
}

/// Builder for [`XdsServer`].
#[derive(Debug, Default)]
pub struct XdsServerBuilder {
    cache: Option<Arc<SnapshotCache>>,
    response_buffer_size: Option<usize>,
}

impl XdsServerBuilder {
    /// Set the snapshot cache. Required.
    pub fn cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the per-stream response buffer size.
    pub fn response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = Some(size);
        self
    }

    /// Build the server.
    pub fn build(self) -> XdsResult<XdsServer> {
        let cache = self
            .cache
            .ok_or_else(|| XdsError::Configuration("cache is required".to_string()))?;
        let response_buffer_size = self.response_buffer_size.unwrap_or(16);
        if response_buffer_size == 0 {
            return Err(XdsError::Configuration(
                "response buffer size must be positive".to_string(),
            ));
        }

        Ok(XdsServer {
            cache,
            response_buffer_size,
        })
    }
}
