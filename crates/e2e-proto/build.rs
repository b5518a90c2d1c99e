//! Build script for e2e-proto.
//!
//! Compiles the trimmed xDS and Google Cloud telemetry protos and writes a
//! file descriptor set used to parse golden text-format fixtures.

use std::env;
use std::path::PathBuf;

const PROTOS: &[&str] = &[
    "proto/envoy/service/discovery/v3/ads.proto",
    "proto/google/monitoring/v3/metric_service.proto",
    "proto/google/logging/v2/logging.proto",
    "proto/google/devtools/cloudtrace/v1/trace.proto",
    "proto/google/devtools/cloudtrace/v2/tracing.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    for proto in PROTOS {
        println!("cargo:rerun-if-changed={proto}");
    }

    let mut config = prost_build::Config::new();
    // Deterministic Debug output for maps keeps canonical keys stable.
    config.btree_map(["."]);
    config.enable_type_names();
    config.file_descriptor_set_path(out_dir.join("e2e_descriptor.bin"));

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .include_file("mod.rs")
        .compile_protos_with_config(config, PROTOS, &["proto"])?;

    Ok(())
}
