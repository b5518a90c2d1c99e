//! Inert OpenTelemetry collector.
//!
//! Accepts log and metric exports, counts them and logs the payload size.
//! Nothing is inspected: scenarios only need a reachable collector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::serve::{self, FakeServer};

#[derive(Debug, Default)]
struct Counters {
    log_exports: AtomicUsize,
    metric_exports: AtomicUsize,
}

/// Collector implementing the OTLP logs and metrics services.
#[derive(Debug, Clone, Default)]
pub struct OtelCollector {
    counters: Arc<Counters>,
}

impl OtelCollector {
    /// Create a collector with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log export calls received.
    pub fn log_exports(&self) -> usize {
        self.counters.log_exports.load(Ordering::Relaxed)
    }

    /// Number of metric export calls received.
    pub fn metric_exports(&self) -> usize {
        self.counters.metric_exports.load(Ordering::Relaxed)
    }

    /// Logs service wrapper.
    pub fn logs_service(&self) -> LogsServiceServer<Self> {
        LogsServiceServer::new(self.clone())
    }

    /// Metrics service wrapper.
    pub fn metrics_service(&self) -> MetricsServiceServer<Self> {
        MetricsServiceServer::new(self.clone())
    }

    /// Serve both collector services on a loopback port.
    pub async fn start(&self, port: u16) -> crate::Result<FakeServer> {
        let listener = serve::bind("otel", port).await?;
        let router = Server::builder()
            .add_service(self.logs_service())
            .add_service(self.metrics_service());
        FakeServer::spawn("otel", listener, |listener, shutdown| {
            router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.wait())
        })
    }
}

#[async_trait]
impl LogsService for OtelCollector {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let request = request.into_inner();
        self.counters.log_exports.fetch_add(1, Ordering::Relaxed);
        debug!(resource_logs = request.resource_logs.len(), "otel log export");
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

#[async_trait]
impl MetricsService for OtelCollector {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let request = request.into_inner();
        self.counters.metric_exports.fetch_add(1, Ordering::Relaxed);
        debug!(resource_metrics = request.resource_metrics.len(), "otel metric export");
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}
