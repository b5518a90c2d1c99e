//! The Stackdriver fake: metrics, logging and trace on one gRPC port.

use std::time::Duration;

use e2e_proto::google::devtools::cloudtrace::{v1 as trace_v1, v2 as trace_v2};
use e2e_proto::google::logging::v2::logging_service_v2_server::LoggingServiceV2Server;
use e2e_proto::google::monitoring::v3::metric_service_server::MetricServiceServer;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::aggregate::{Aggregator, Consumer};
use crate::auth::BearerAuth;
use crate::logging::LoggingServer;
use crate::metrics::MetricServer;
use crate::serve::{self, FakeServer};
use crate::tls::TlsFiles;
use crate::trace::TraceServer;
use crate::{FakeError, Result};

const NAME: &str = "stackdriver";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for [`FakeStackdriver`].
#[derive(Debug, Clone, Default)]
pub struct StackdriverBuilder {
    port: u16,
    delay: Duration,
    tls: Option<TlsFiles>,
    auth: BearerAuth,
}

impl StackdriverBuilder {
    /// Port to listen on; `0` picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Delay applied to metric and log writes before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve TLS with the given fixtures.
    pub fn tls(mut self, files: TlsFiles) -> Self {
        self.tls = Some(files);
        self
    }

    /// Credential check applied to every call.
    pub fn auth(mut self, auth: BearerAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Bind and start serving.
    pub async fn start(self) -> Result<FakeStackdriver> {
        let aggregator = Aggregator::new();
        let (ingest, consumer) = aggregator.start();
        let metrics = MetricServer::new(ingest.clone()).with_delay(self.delay);
        let logging = LoggingServer::new(ingest).with_delay(self.delay);
        let traces = TraceServer::new();

        let mut builder = Server::builder();
        if let Some(files) = &self.tls {
            builder = builder
                .tls_config(files.server_config()?)
                .map_err(|e| FakeError::transport(NAME, e))?;
        }
        let auth = self.auth;
        let router = builder
            .add_service(MetricServiceServer::with_interceptor(metrics.clone(), auth.clone()))
            .add_service(LoggingServiceV2Server::with_interceptor(logging.clone(), auth.clone()))
            .add_service(trace_v1::trace_service_server::TraceServiceServer::with_interceptor(
                traces.clone(),
                auth.clone(),
            ))
            .add_service(trace_v2::trace_service_server::TraceServiceServer::with_interceptor(
                traces.clone(),
                auth,
            ));

        let listener = serve::bind(NAME, self.port).await?;
        let server = FakeServer::spawn(NAME, listener, |listener, shutdown| {
            router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.wait())
        })?;
        info!(port = server.port(), tls = self.tls.is_some(), "stackdriver fake started");

        Ok(FakeStackdriver {
            server,
            consumer,
            state: StackdriverState {
                aggregator,
                metrics,
                logging,
                traces,
            },
        })
    }
}

/// Shared view of what a Stackdriver fake has received.
///
/// Cloning is cheap and every clone sees the same state, so assertion steps
/// can hold one while the fake itself is owned elsewhere.
#[derive(Debug, Clone)]
pub struct StackdriverState {
    aggregator: Aggregator,
    metrics: MetricServer,
    logging: LoggingServer,
    traces: TraceServer,
}

impl StackdriverState {
    /// Aggregated metrics and logs.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Raw metric replay buffer.
    pub fn metrics(&self) -> &MetricServer {
        &self.metrics
    }

    /// Raw log entries.
    pub fn logging(&self) -> &LoggingServer {
        &self.logging
    }

    /// Trace store.
    pub fn traces(&self) -> &TraceServer {
        &self.traces
    }

    /// Forget everything received so far.
    pub fn reset(&self) {
        self.aggregator.reset();
        self.metrics.reset();
        self.logging.reset();
        self.traces.reset();
    }
}

/// Running Stackdriver fake.
#[derive(Debug)]
pub struct FakeStackdriver {
    server: FakeServer,
    consumer: Consumer,
    state: StackdriverState,
}

impl FakeStackdriver {
    /// Start configuring a fake.
    pub fn builder() -> StackdriverBuilder {
        StackdriverBuilder::default()
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Received state.
    pub fn state(&self) -> &StackdriverState {
        &self.state
    }

    /// Aggregated metrics and logs.
    pub fn aggregator(&self) -> &Aggregator {
        self.state.aggregator()
    }

    /// Raw metric replay buffer.
    pub fn metrics(&self) -> &MetricServer {
        self.state.metrics()
    }

    /// Trace store.
    pub fn traces(&self) -> &TraceServer {
        self.state.traces()
    }

    /// Forget everything received so far.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Stop serving, then fold in every payload already queued. The state
    /// stays readable.
    pub async fn stop(&mut self) {
        self.server.stop().await;
        self.consumer.drain(DRAIN_TIMEOUT).await;
    }
}
