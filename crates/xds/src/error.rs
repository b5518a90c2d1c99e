//! Error types for the mock control plane.

/// Error type for snapshot publication and the discovery stream.
///
/// Converts to [`tonic::Status`] so stream handlers can return it directly.
#[derive(Debug, thiserror::Error)]
pub enum XdsError {
    /// The type URL is not one the control plane serves.
    #[error("invalid type URL: {type_url} - {reason}")]
    InvalidTypeUrl {
        /// The offending type URL.
        type_url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A resource failed validation or could not be built.
    #[error("invalid resource {type_url}/{name}: {reason}")]
    InvalidResource {
        /// The type URL of the resource.
        type_url: String,
        /// The resource name, possibly empty if it could not be determined.
        name: String,
        /// Reason for the failure.
        reason: String,
    },

    /// The resource document could not be decoded into its message type.
    #[error("decoding error for {type_url}: {message}")]
    DecodingError {
        /// The type URL being decoded.
        type_url: String,
        /// Error message.
        message: String,
    },

    /// gRPC transport error.
    #[error("transport error: {message}")]
    TransportError {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A discovery stream was used incorrectly by the client.
    #[error("stream error: {reason}")]
    StreamError {
        /// What went wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl XdsError {
    /// Create a transport error from any error type.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransportError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a decoding error for a type URL.
    pub fn decoding(type_url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::DecodingError {
            type_url: type_url.into(),
            message: message.to_string(),
        }
    }
}

impl From<XdsError> for tonic::Status {
    fn from(err: XdsError) -> Self {
        match &err {
            XdsError::InvalidTypeUrl { .. }
            | XdsError::InvalidResource { .. }
            | XdsError::DecodingError { .. }
            | XdsError::StreamError { .. }
            | XdsError::Configuration(_) => tonic::Status::invalid_argument(err.to_string()),
            XdsError::TransportError { .. } => tonic::Status::unavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_error_names_type() {
        let err = XdsError::decoding(crate::TypeUrl::LISTENER, "missing field `name`");
        assert!(err.to_string().contains("envoy.config.listener.v3.Listener"));
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn stream_error_to_status() {
        let err = XdsError::StreamError {
            reason: "first request carried no node".to_string(),
        };
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn transport_error_to_status() {
        let io_err = std::io::Error::other("address in use");
        let status: tonic::Status = XdsError::transport("bind failed", io_err).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
