//! Error types for the fake backends.

use std::path::PathBuf;

use tonic::Status;

/// Error type for the fake backends.
///
/// Startup failures (bind, TLS) surface to the step that starts the fake.
/// Request-level failures are turned into a [`Status`] and returned to the
/// caller; they never stop the fake.
#[derive(Debug, thiserror::Error)]
pub enum FakeError {
    /// The caller presented unexpected credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The listening port could not be bound.
    #[error("failed to bind {name} on port {port}: {source}")]
    Bind {
        /// Which fake was starting.
        name: &'static str,
        /// The requested port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A TLS fixture could not be read.
    #[error("failed to read TLS fixture {}: {source}", path.display())]
    TlsFixture {
        /// Fixture path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The gRPC transport rejected its configuration.
    #[error("{name} transport error: {source}")]
    Transport {
        /// Which fake was starting.
        name: &'static str,
        /// Underlying transport error.
        #[source]
        source: tonic::transport::Error,
    },
}

impl FakeError {
    /// Create a transport error.
    pub fn transport(name: &'static str, source: tonic::transport::Error) -> Self {
        Self::Transport { name, source }
    }
}

impl From<FakeError> for Status {
    fn from(err: FakeError) -> Self {
        match err {
            FakeError::Unauthenticated(msg) => Status::unauthenticated(msg),
            FakeError::Bind { .. } | FakeError::Transport { .. } => {
                Status::unavailable(err.to_string())
            }
            FakeError::TlsFixture { .. } => Status::internal(err.to_string()),
        }
    }
}

/// Result type alias using [`FakeError`].
pub type Result<T> = std::result::Result<T, FakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_port() {
        let err = FakeError::Bind {
            name: "stackdriver",
            port: 20011,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let text = err.to_string();
        assert!(text.contains("stackdriver"));
        assert!(text.contains("20011"));
    }

    #[test]
    fn unauthenticated_maps_to_status() {
        let status: Status = FakeError::Unauthenticated("bad bearer".into()).into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
        assert_eq!(status.message(), "bad bearer");
    }
}
