//! Bearer-token and quota-project check for the gRPC fakes.

use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;

use crate::FakeError;

/// Bearer token the fakes accept by default.
pub const EXPECTED_BEARER: &str = "ya29.envoye2e-access-token";

/// Quota project the fakes accept by default.
pub const EXPECTED_PROJECT: &str = "test-project";

/// Header carrying the quota project.
pub const PROJECT_HEADER: &str = "x-goog-user-project";

/// Interceptor that rejects calls without the expected credentials.
///
/// A disabled interceptor lets every call through.
#[derive(Debug, Clone, Default)]
pub struct BearerAuth {
    expected: Option<(String, String)>,
}

impl BearerAuth {
    /// Require `Authorization: Bearer <token>` and the quota project header.
    pub fn new(token: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            expected: Some((token.into(), project.into())),
        }
    }

    /// Accept every call.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Validate request metadata.
    pub fn check(&self, metadata: &MetadataMap) -> Result<(), FakeError> {
        let Some((token, project)) = &self.expected else {
            return Ok(());
        };

        let authorization = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if authorization != format!("Bearer {token}") {
            warn!(authorization = %authorization, "rejecting call with unexpected bearer");
            return Err(FakeError::Unauthenticated(format!(
                "unexpected authorization header {authorization:?}"
            )));
        }

        let quota = metadata
            .get(PROJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if quota != project {
            warn!(project = %quota, "rejecting call with unexpected quota project");
            return Err(FakeError::Unauthenticated(format!(
                "unexpected {PROJECT_HEADER} header {quota:?}"
            )));
        }

        Ok(())
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.check(request.metadata())?;
        Ok(request)
    }
}
