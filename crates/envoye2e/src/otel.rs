//! OpenTelemetry collector step.

use async_trait::async_trait;
use e2e_fakes::{FakeServer, OtelCollector};

use crate::scenario::Step;
use crate::{Params, Result};

/// Run an OTLP logs and metrics collector on `ports.otel`.
#[derive(Debug, Default)]
pub struct Otel {
    port: Option<u16>,
    collector: OtelCollector,
    server: Option<FakeServer>,
}

impl Otel {
    /// Collector on `ports.otel`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Export counters, shared with the running collector.
    pub fn collector(&self) -> OtelCollector {
        self.collector.clone()
    }
}

#[async_trait]
impl Step for Otel {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.otel);
        self.server = Some(self.collector.start(port).await?);
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }
}
