//! Stackdriver step and its assertions, fed by generated gRPC clients.

use std::time::Duration;

use e2e_proto::google::api::metric_descriptor::{MetricKind, ValueType};
use e2e_proto::google::api::{Metric, MonitoredResource};
use e2e_proto::google::devtools::cloudtrace::v2 as trace_v2;
use e2e_proto::google::logging::r#type::HttpRequest;
use e2e_proto::google::logging::v2::logging_service_v2_client::LoggingServiceV2Client;
use e2e_proto::google::logging::v2::{LogEntry, WriteLogEntriesRequest};
use e2e_proto::google::monitoring::v3::metric_service_client::MetricServiceClient;
use e2e_proto::google::monitoring::v3::{
    typed_value, CreateTimeSeriesRequest, Point, TimeInterval, TimeSeries, TypedValue,
};
use envoye2e::{Error, Params, Stackdriver, Step};
use tonic::transport::Channel;

const METRIC_FIXTURE: &str = "stackdriver/server_request_count.textproto.tmpl";
const LOG_FIXTURE: &str = "stackdriver/server_access_log.textproto.tmpl";

async fn channel(port: u16) -> Channel {
    Channel::from_shared(format!("http://127.0.0.1:{port}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

fn request_count(params: &Params, value: i64, second: i64) -> CreateTimeSeriesRequest {
    let ts = TimeSeries {
        metric: Some(Metric {
            r#type: "istio.io/service/server/request_count".into(),
            labels: [
                ("destination_service_name".to_string(), "server".to_string()),
                ("response_code".to_string(), "200".to_string()),
            ]
            .into(),
        }),
        resource: Some(MonitoredResource {
            r#type: "k8s_container".into(),
            labels: [("pod_name".to_string(), format!("server-{}", params.ports.server))].into(),
        }),
        metric_kind: MetricKind::Delta as i32,
        value_type: ValueType::Int64 as i32,
        points: vec![Point {
            interval: Some(TimeInterval {
                start_time: Some(prost_types::Timestamp { seconds: second, nanos: 0 }),
                end_time: Some(prost_types::Timestamp { seconds: second + 1, nanos: 0 }),
            }),
            value: Some(TypedValue {
                value: Some(typed_value::Value::Int64Value(value)),
            }),
        }],
        ..Default::default()
    };
    CreateTimeSeriesRequest {
        name: "projects/test-project".into(),
        time_series: vec![ts],
    }
}

fn access_log(params: &Params, latency_ms: i32) -> WriteLogEntriesRequest {
    WriteLogEntriesRequest {
        log_name: "projects/test-project/logs/server-accesslog-stackdriver".into(),
        labels: [("destination_service_name".to_string(), "server".to_string())].into(),
        entries: vec![LogEntry {
            insert_id: format!("entry-{latency_ms}"),
            timestamp: Some(prost_types::Timestamp { seconds: 100, nanos: 0 }),
            labels: [
                ("response_flag".to_string(), "-".to_string()),
                ("request_id".to_string(), format!("req-{latency_ms}")),
            ]
            .into(),
            http_request: Some(HttpRequest {
                request_method: "GET".into(),
                request_url: format!("http://127.0.0.1:{}/", params.ports.server),
                status: 200,
                protocol: "HTTP/1.1".into(),
                remote_ip: "10.0.0.1".into(),
                response_size: 13,
                latency: Some(prost_types::Duration {
                    seconds: 0,
                    nanos: latency_ms * 1_000_000,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn metrics_logs_and_reset() {
    envoye2e::init_tracing();
    let mut params = Params::new(57).with_vars([("RequestCount", "7")]);
    let mut sd = Stackdriver::new();
    sd.run(&mut params).await.unwrap();

    let ch = channel(params.ports.sd).await;
    let mut metrics = MetricServiceClient::new(ch.clone());
    let mut logging = LoggingServiceV2Client::new(ch);
    metrics.create_time_series(request_count(&params, 3, 10)).await.unwrap();
    metrics.create_time_series(request_count(&params, 4, 20)).await.unwrap();
    logging.write_log_entries(access_log(&params, 5)).await.unwrap();
    logging.write_log_entries(access_log(&params, 8)).await.unwrap();

    sd.check([METRIC_FIXTURE], [LOG_FIXTURE])
        .verify_latency(true)
        .attempts(20)
        .interval(Duration::from_millis(100))
        .run(&mut params)
        .await
        .unwrap();

    params.set("RequestCount", "8");
    let err = sd
        .check([METRIC_FIXTURE], Vec::<String>::new())
        .attempts(2)
        .interval(Duration::from_millis(10))
        .run(&mut params)
        .await
        .unwrap_err();
    match err {
        Error::Timeout { diff, .. } => {
            assert!(diff.contains("missing"), "{diff}");
            assert!(diff.contains("unexpected"), "{diff}");
            assert!(diff.contains("Int64Value(8)"), "{diff}");
        }
        other => panic!("unexpected error: {other}"),
    }

    sd.reset().run(&mut params).await.unwrap();
    params.set("RequestCount", "7");
    assert!(sd
        .check([METRIC_FIXTURE], Vec::<String>::new())
        .attempts(1)
        .run(&mut params)
        .await
        .is_err());

    let mut check = sd.check(Vec::<String>::new(), [LOG_FIXTURE]).attempts(1);
    sd.cleanup().await;
    let err = check.run(&mut params).await.unwrap_err();
    assert!(matches!(err, Error::NotStarted(_)), "{err}");
}

#[tokio::test]
async fn traces_by_filter() {
    let mut params = Params::new(58);
    let mut sd = Stackdriver::new();
    sd.run(&mut params).await.unwrap();

    let mut writer = trace_v2::trace_service_client::TraceServiceClient::new(channel(params.ports.sd).await);
    let span = |trace: &str, id: &str, parent: &str, name: &str| trace_v2::Span {
        name: format!("projects/test-project/traces/{trace}/spans/{id}"),
        span_id: id.to_string(),
        parent_span_id: parent.to_string(),
        display_name: Some(trace_v2::TruncatableString {
            value: name.to_string(),
            truncated_byte_count: 0,
        }),
        ..Default::default()
    };
    writer
        .batch_write_spans(trace_v2::BatchWriteSpansRequest {
            name: "projects/test-project".into(),
            spans: vec![
                span("t1", "0a", "", "server:ingress"),
                span("t1", "0b", "0a", "backend"),
                span("t2", "0c", "", "server:health"),
            ],
        })
        .await
        .unwrap();

    sd.check_traces("root:server", 2).attempts(10).interval(Duration::from_millis(50))
        .run(&mut params)
        .await
        .unwrap();
    sd.check_traces("+root:server:ingress span:backend", 1).attempts(1)
        .run(&mut params)
        .await
        .unwrap();
    let err = sd
        .check_traces("span:backend", 2)
        .attempts(2)
        .interval(Duration::from_millis(10))
        .run(&mut params)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("got 1 traces, want 2"), "{err}");

    sd.cleanup().await;
}

#[tokio::test]
async fn bearer_check_rejects_anonymous_writes() {
    let mut params = Params::new(59);
    let mut sd = Stackdriver::new().bearer(true);
    sd.run(&mut params).await.unwrap();

    let mut metrics = MetricServiceClient::new(channel(params.ports.sd).await);
    let status = metrics
        .create_time_series(request_count(&params, 1, 1))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);

    sd.cleanup().await;
}
