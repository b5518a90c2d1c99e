//! HTTP backend fake.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use e2e_fakes::serve::{self, FakeServer};

use crate::scenario::Step;
use crate::{Params, Result};

/// Body served on every route.
pub const BACKEND_BODY: &str = "hello, world!";

const CLOSE_DELAY: Duration = Duration::from_secs(3);

/// Plain HTTP server behind the proxy.
///
/// `/` answers immediately. `/close` answers after a delay and asks the
/// client to close the connection, which exercises connection reuse and
/// idle timeouts in the proxy.
#[derive(Debug)]
pub struct Backend {
    port: Option<u16>,
    close_delay: Duration,
    server: Option<FakeServer>,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            port: None,
            close_delay: CLOSE_DELAY,
            server: None,
        }
    }
}

impl Backend {
    /// Backend on `ports.backend`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Delay before `/close` answers.
    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Port the running backend listens on.
    pub fn bound_port(&self) -> Option<u16> {
        self.server.as_ref().map(FakeServer::port)
    }

    fn router(&self) -> Router {
        let delay = self.close_delay;
        Router::new()
            .route("/", get(|| async { BACKEND_BODY }))
            .route("/close", get(move || close(delay)))
    }
}

async fn close(delay: Duration) -> impl IntoResponse {
    tokio::time::sleep(delay).await;
    ([(header::CONNECTION, "close")], BACKEND_BODY)
}

#[async_trait]
impl Step for Backend {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.backend);
        let listener = serve::bind("backend", port).await?;
        let app = self.router();
        let server = FakeServer::spawn("backend", listener, move |listener, shutdown| async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.wait())
                .await
        })?;
        self.server = Some(server);
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }
}
