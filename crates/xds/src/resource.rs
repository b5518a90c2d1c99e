//! Named xDS resources and YAML decoding.
//!
//! The control plane never links the full Envoy API. Resources are decoded
//! at runtime from YAML against a descriptor pool that contains the Envoy
//! message definitions, then carried as protobuf `Any` payloads.

use std::path::Path;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage};
use prost_types::Any;

use crate::{TypeUrl, XdsError, XdsResult};

/// A named, already-encoded xDS resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    type_url: TypeUrl,
    name: String,
    body: Any,
}

impl Resource {
    /// Wrap an encoded message.
    pub fn new(type_url: impl Into<TypeUrl>, name: impl Into<String>, value: Vec<u8>) -> Self {
        let type_url = type_url.into();
        let body = Any {
            type_url: type_url.to_string(),
            value,
        };
        Self {
            type_url,
            name: name.into(),
            body,
        }
    }

    /// The resource type.
    #[inline]
    pub fn type_url(&self) -> &TypeUrl {
        &self.type_url
    }

    /// The resource name, as Envoy subscribes to it.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The encoded payload.
    #[inline]
    pub fn body(&self) -> &Any {
        &self.body
    }
}

/// Decodes YAML resource documents into [`Resource`]s.
#[derive(Debug, Clone)]
pub struct ResourceParser {
    pool: DescriptorPool,
}

impl ResourceParser {
    /// Create a parser over an existing descriptor pool.
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Create a parser from a serialized `FileDescriptorSet`.
    pub fn from_descriptor_set(bytes: &[u8]) -> XdsResult<Self> {
        let pool = DescriptorPool::decode(bytes)
            .map_err(|e| XdsError::Configuration(format!("invalid descriptor set: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Load a serialized `FileDescriptorSet` from disk.
    pub fn from_file(path: impl AsRef<Path>) -> XdsResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            XdsError::Configuration(format!(
                "failed to read descriptor set {}: {e}",
                path.display()
            ))
        })?;
        Self::from_descriptor_set(&bytes)
    }

    /// Decode one YAML document as a message of `type_url`.
    ///
    /// The document must carry a non-empty `name` field. Unknown fields are
    /// rejected so a typo in a template fails the step instead of silently
    /// dropping configuration.
    pub fn parse_yaml(&self, type_url: &TypeUrl, yaml: &str) -> XdsResult<Resource> {
        let descriptor = self
            .pool
            .get_message_by_name(type_url.message_name())
            .ok_or_else(|| XdsError::InvalidTypeUrl {
                type_url: type_url.to_string(),
                reason: "message not present in descriptor set".to_string(),
            })?;

        let document: serde_json::Value =
            serde_yaml::from_str(yaml).map_err(|e| XdsError::decoding(type_url.as_str(), e))?;

        let message = DynamicMessage::deserialize(descriptor, document)
            .map_err(|e| XdsError::decoding(type_url.as_str(), e))?;

        let name = message
            .get_field_by_name("name")
            .and_then(|value| value.as_str().map(str::to_owned))
            .unwrap_or_default();
        if name.is_empty() {
            return Err(XdsError::InvalidResource {
                type_url: type_url.to_string(),
                name,
                reason: "resource has no name".to_string(),
            });
        }

        Ok(Resource::new(type_url.clone(), name, message.encode_to_vec()))
    }
}
