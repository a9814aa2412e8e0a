//! Generates the RPC service and client stubs.
//!
//! Messages are hand-written `prost` structs in `src/receiver/proto.rs`, so
//! the manual builder is used and no `protoc` is required.

use tonic_build::manual::{Builder, Method, Service};

const PROTO_MOD: &str = "crate::receiver::proto";

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("{PROTO_MOD}::{input}"))
        .output_type(format!("{PROTO_MOD}::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("Metrics")
        .package("tally")
        .method(method("get_metric", "GetMetric", "GetMetricRequest", "GetMetricResponse"))
        .method(method(
            "update_metric",
            "UpdateMetric",
            "UpdateMetricRequest",
            "UpdateMetricResponse",
        ))
        .method(method(
            "update_metrics",
            "UpdateMetrics",
            "UpdateMetricsRequest",
            "UpdateMetricsResponse",
        ))
        .method(method(
            "get_all_metrics",
            "GetAllMetrics",
            "GetAllMetricsRequest",
            "GetAllMetricsResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
