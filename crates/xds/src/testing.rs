//! Helpers for tests that need Envoy message descriptors.
//!
//! Real runs load the full Envoy API from a descriptor set on disk. Tests use
//! this stand-in pool, which declares `Listener` and `Cluster` with a handful
//! of scalar fields.

use prost_reflect::DescriptorPool;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
};

fn field(name: &str, json_name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(json_name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn file(path: &str, package: &str, message: &str, fields: Vec<FieldDescriptorProto>) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(path.to_string()),
        package: Some(package.to_string()),
        message_type: vec![DescriptorProto {
            name: Some(message.to_string()),
            field: fields,
            ..Default::default()
        }],
        syntax: Some("proto3".to_string()),
        ..Default::default()
    }
}

/// A descriptor pool with minimal `Listener` and `Cluster` messages.
pub fn envoy_pool() -> DescriptorPool {
    let listener = file(
        "envoy/config/listener/v3/listener.proto",
        "envoy.config.listener.v3",
        "Listener",
        vec![
            field("name", "name", 1, Type::String),
            field("stat_prefix", "statPrefix", 2, Type::String),
            field("port", "port", 3, Type::Uint32),
        ],
    );
    let cluster = file(
        "envoy/config/cluster/v3/cluster.proto",
        "envoy.config.cluster.v3",
        "Cluster",
        vec![
            field("name", "name", 1, Type::String),
            field("connect_timeout", "connectTimeout", 4, Type::String),
            field("port", "port", 5, Type::Uint32),
        ],
    );

    DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
        file: vec![listener, cluster],
    })
    .expect("static test descriptors are valid")
}
