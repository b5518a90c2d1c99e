//! Golden fixture loading.
//!
//! Fixtures are protobuf text-format documents. They are parsed against the
//! descriptor set compiled into this crate and transcoded into the generated
//! prost types, so a fixture can be compared structurally with what a fake
//! backend received.

use std::path::Path;

use once_cell::sync::OnceCell;
use prost::{Message, Name};
use prost_reflect::{DescriptorPool, DynamicMessage};

use crate::FILE_DESCRIPTOR_SET;

/// Errors raised while loading golden fixtures.
#[derive(Debug, thiserror::Error)]
pub enum GoldenError {
    /// The fixture file could not be read.
    #[error("failed to read fixture {path}: {source}")]
    Io {
        /// Path of the fixture.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The embedded descriptor set is unusable.
    #[error("invalid descriptor set: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// The message type is not part of the descriptor set.
    #[error("unknown message type {0}")]
    UnknownMessage(String),

    /// The text-format document does not match the message schema.
    #[error("failed to parse {type_name} text format: {source}")]
    Parse {
        /// Fully qualified message name.
        type_name: String,
        /// Parser error.
        #[source]
        source: prost_reflect::text_format::ParseError,
    },

    /// The parsed message could not be converted to the generated type.
    #[error("failed to transcode {type_name}: {source}")]
    Transcode {
        /// Fully qualified message name.
        type_name: String,
        /// Decode error.
        #[source]
        source: prost::DecodeError,
    },
}

/// Result type alias using [`GoldenError`].
pub type Result<T> = std::result::Result<T, GoldenError>;

static POOL: OnceCell<DescriptorPool> = OnceCell::new();

/// The descriptor pool backing fixture parsing.
pub fn descriptor_pool() -> Result<&'static DescriptorPool> {
    POOL.get_or_try_init(|| DescriptorPool::decode(FILE_DESCRIPTOR_SET).map_err(GoldenError::from))
}

/// Parse a text-format document into a generated message.
pub fn parse_text<T>(text: &str) -> Result<T>
where
    T: Message + Name + Default,
{
    let type_name = T::full_name();
    let descriptor = descriptor_pool()?
        .get_message_by_name(&type_name)
        .ok_or_else(|| GoldenError::UnknownMessage(type_name.clone()))?;

    let dynamic = DynamicMessage::parse_text_format(descriptor, text).map_err(|source| {
        GoldenError::Parse {
            type_name: type_name.clone(),
            source,
        }
    })?;

    dynamic
        .transcode_to::<T>()
        .map_err(|source| GoldenError::Transcode { type_name, source })
}

/// Read and parse a text-format fixture file.
pub fn load<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: Message + Name + Default,
{
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| GoldenError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_text(&text)
}

/// Render a message in text format, for failure output.
///
/// Falls back to the `Debug` rendering if the type is not in the pool.
pub fn to_text<T>(message: &T) -> String
where
    T: Message + Name + std::fmt::Debug,
{
    let descriptor = descriptor_pool()
        .ok()
        .and_then(|pool| pool.get_message_by_name(&T::full_name()));

    match descriptor {
        Some(descriptor) => {
            let mut dynamic = DynamicMessage::new(descriptor);
            match dynamic.transcode_from(message) {
                Ok(()) => dynamic.to_text_format(),
                Err(_) => format!("{message:?}"),
            }
        }
        None => format!("{message:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::api::metric_descriptor::MetricKind;
    use crate::google::monitoring::v3::{typed_value, TimeSeries};

    const REQUEST_COUNT: &str = r#"
        metric {
          type: "istio.io/service/server/request_count"
          labels { key: "response_code" value: "200" }
          labels { key: "request_protocol" value: "http" }
        }
        resource { type: "k8s_container" labels { key: "pod_name" value: "server" } }
        metric_kind: DELTA
        value_type: INT64
        points { value { int64_value: 10 } }
    "#;

    #[test]
    fn parse_time_series() {
        let ts: TimeSeries = parse_text(REQUEST_COUNT).unwrap();

        let metric = ts.metric.as_ref().unwrap();
        assert_eq!(metric.r#type, "istio.io/service/server/request_count");
        assert_eq!(metric.labels.get("response_code").map(String::as_str), Some("200"));
        assert_eq!(ts.metric_kind(), MetricKind::Delta);
        assert_eq!(
            ts.points[0].value.as_ref().and_then(|v| v.value.clone()),
            Some(typed_value::Value::Int64Value(10))
        );
    }

    #[test]
    fn parse_rejects_unknown_field() {
        let err = parse_text::<TimeSeries>("no_such_field: 1").unwrap_err();
        assert!(matches!(err, GoldenError::Parse { .. }));
    }

    #[test]
    fn load_reports_path() {
        let err = load::<TimeSeries>("/nonexistent/fixture.textproto").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fixture.textproto"));
    }

    #[test]
    fn text_rendering_round_trips() {
        let ts: TimeSeries = parse_text(REQUEST_COUNT).unwrap();
        let text = to_text(&ts);
        let again: TimeSeries = parse_text(&text).unwrap();
        assert_eq!(ts, again);
    }
}
