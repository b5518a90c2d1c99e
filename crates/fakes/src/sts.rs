//! Secure Token Service emulator.
//!
//! Serves `/health` and `/token`. A token request is honoured only when its
//! body is byte-for-byte [`EXPECTED_TOKEN_REQUEST`]; any other body is
//! logged and answered with an empty `200`, so a client with a wrong
//! request sees no error, just no token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, warn};

use crate::auth::EXPECTED_BEARER;
use crate::serve::{self, FakeServer};
use crate::Result;

/// Token-exchange body the proxy is expected to send.
pub const EXPECTED_TOKEN_REQUEST: &str = concat!(
    r#"{"audience":"test-project.svc.id.goog","#,
    r#""grantType":"urn:ietf:params:oauth:grant-type:token-exchange","#,
    r#""requestedTokenType":"urn:ietf:params:oauth:token-type:access_token","#,
    r#""scope":"https://www.googleapis.com/auth/cloud-platform","#,
    r#""subjectToken":"kubernetes-service-account-token","#,
    r#""subjectTokenType":"urn:ietf:params:oauth:token-type:jwt"}"#,
);

/// Lifetime advertised for issued tokens.
pub const TOKEN_LIFETIME_SECS: u64 = 3600;

/// JSON body returned for an accepted token request.
pub fn token_response() -> String {
    serde_json::json!({
        "access_token": EXPECTED_BEARER,
        "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
        "token_type": "Bearer",
        "expires_in": TOKEN_LIFETIME_SECS,
    })
    .to_string()
}

/// Token exchange emulator.
#[derive(Debug, Clone, Default)]
pub struct SecureTokenService {
    issued: Arc<AtomicUsize>,
}

impl SecureTokenService {
    /// Create an emulator that has issued nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens handed out.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// HTTP routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/token", post(token))
            .with_state(self.clone())
    }

    /// Serve on a loopback port.
    pub async fn start(&self, port: u16) -> Result<FakeServer> {
        let listener = serve::bind("sts", port).await?;
        let app = self.router();
        FakeServer::spawn("sts", listener, move |listener, shutdown| async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.wait())
                .await
        })
    }
}

async fn token(State(sts): State<SecureTokenService>, body: String) -> Response {
    if body != EXPECTED_TOKEN_REQUEST {
        warn!(body = %body, "ignoring unexpected token request");
        return StatusCode::OK.into_response();
    }

    sts.issued.fetch_add(1, Ordering::Relaxed);
    debug!("issuing access token");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        token_response(),
    )
        .into_response()
}
