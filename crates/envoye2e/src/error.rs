//! Error type for the driver.

use e2e_fakes::FakeError;
use e2e_proto::GoldenError;
use e2e_xds::XdsError;

/// Error returned by a failing step.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A template failed to render.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A document could not be parsed.
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: String,
        /// Parser message.
        message: String,
    },

    /// An I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        /// File, port or operation that failed.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The proxy process misbehaved.
    #[error("envoy process: {0}")]
    Process(String),

    /// An HTTP exchange did not produce the expected result.
    #[error("HTTP {url}: {message}")]
    Http {
        /// Request URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// A TCP exchange did not produce the expected result.
    #[error("TCP port {port}: {message}")]
    Tcp {
        /// Target port.
        port: u16,
        /// Failure description.
        message: String,
    },

    /// A polled assertion never held.
    #[error("{what} did not match after {attempts} attempts:\n{diff}")]
    Timeout {
        /// What was being checked.
        what: String,
        /// Number of polls made.
        attempts: usize,
        /// Expected versus last observed state.
        diff: String,
    },

    /// A step ran before the step it depends on.
    #[error("{0}")]
    NotStarted(&'static str),

    /// The environment is missing required configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Control plane error.
    #[error(transparent)]
    Xds(#[from] XdsError),

    /// Fake backend error.
    #[error(transparent)]
    Fake(#[from] FakeError),

    /// Golden fixture error.
    #[error(transparent)]
    Golden(#[from] GoldenError),

    /// Free-form failure from a closure step.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an I/O error with what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a parse error.
    pub fn parse(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Create an HTTP error.
    pub fn http(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Http {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
