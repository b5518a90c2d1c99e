//! Exercise the fakes over real loopback sockets.

use std::collections::BTreeSet;
use std::time::Duration;

use e2e_fakes::{BearerAuth, FakeStackdriver, OtelCollector, SecureTokenService};
use e2e_fakes::{EXPECTED_BEARER, EXPECTED_PROJECT, PROJECT_HEADER};
use e2e_proto::google::api::metric_descriptor::MetricKind;
use e2e_proto::google::api::Metric;
use e2e_proto::google::devtools::cloudtrace::{v1 as trace_v1, v2 as trace_v2};
use e2e_proto::google::logging::v2::logging_service_v2_client::LoggingServiceV2Client;
use e2e_proto::google::logging::v2::{ListLogsRequest, LogEntry, WriteLogEntriesRequest};
use e2e_proto::google::monitoring::v3::metric_service_client::MetricServiceClient;
use e2e_proto::google::monitoring::v3::{
    typed_value, CreateTimeSeriesRequest, ListTimeSeriesRequest, Point, TimeSeries, TypedValue,
};
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::Request;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("e2e_fakes=debug")
        .with_test_writer()
        .try_init();
}

async fn channel(port: u16) -> Channel {
    Channel::from_shared(format!("http://127.0.0.1:{port}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

fn series(kind: MetricKind, value: i64) -> TimeSeries {
    TimeSeries {
        metric: Some(Metric {
            r#type: "istio.io/service/server/request_count".to_string(),
            labels: [("response_code".to_string(), "200".to_string())].into(),
        }),
        metric_kind: kind as i32,
        points: vec![Point {
            interval: None,
            value: Some(TypedValue {
                value: Some(typed_value::Value::Int64Value(value)),
            }),
        }],
        ..Default::default()
    }
}

fn create(kind: MetricKind, value: i64) -> CreateTimeSeriesRequest {
    CreateTimeSeriesRequest {
        name: format!("projects/{EXPECTED_PROJECT}"),
        time_series: vec![series(kind, value)],
    }
}

/// Poll until the aggregate has caught up with the ingest channel.
async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn only_int(sd: &FakeStackdriver) -> Option<i64> {
    let all = sd.aggregator().metrics();
    let ts = all.values().next()?;
    match ts.points.first()?.value.as_ref()?.value.as_ref()? {
        typed_value::Value::Int64Value(n) => Some(*n),
        _ => None,
    }
}

#[tokio::test]
async fn delta_metrics_sum_over_grpc() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let mut client = MetricServiceClient::new(channel(sd.port()).await);

    for n in [1, 2, 3, 4] {
        client.create_time_series(create(MetricKind::Delta, n)).await.unwrap();
    }
    eventually(|| only_int(&sd) == Some(10)).await;

    let replay = client
        .list_time_series(ListTimeSeriesRequest::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(replay.time_series.len(), 4);

    sd.stop().await;
}

#[tokio::test]
async fn stop_keeps_writes_sent_just_before() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let mut client = MetricServiceClient::new(channel(sd.port()).await);

    client.create_time_series(create(MetricKind::Delta, 4)).await.unwrap();
    sd.stop().await;
    assert_eq!(only_int(&sd), Some(4));
}

#[tokio::test]
async fn gauge_metrics_keep_last_value() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let mut client = MetricServiceClient::new(channel(sd.port()).await);

    for n in [7, 3, 5] {
        client.create_time_series(create(MetricKind::Gauge, n)).await.unwrap();
    }
    eventually(|| sd.metrics().received().len() == 3).await;
    eventually(|| only_int(&sd) == Some(5)).await;

    sd.reset();
    assert!(sd.aggregator().metrics().is_empty());
    assert!(sd.metrics().received().is_empty());
    sd.stop().await;
}

#[tokio::test]
async fn bearer_check_rejects_before_handler() {
    init_tracing();
    let mut sd = FakeStackdriver::builder()
        .auth(BearerAuth::new(EXPECTED_BEARER, EXPECTED_PROJECT))
        .start()
        .await
        .unwrap();
    let mut client = MetricServiceClient::new(channel(sd.port()).await);

    let status = client
        .create_time_series(create(MetricKind::Delta, 1))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);

    let mut request = Request::new(create(MetricKind::Delta, 1));
    request
        .metadata_mut()
        .insert("authorization", format!("Bearer {EXPECTED_BEARER}").parse().unwrap());
    request
        .metadata_mut()
        .insert(PROJECT_HEADER, EXPECTED_PROJECT.parse().unwrap());
    client.create_time_series(request).await.unwrap();

    assert_eq!(sd.metrics().received().len(), 1);
    sd.stop().await;
}

#[tokio::test]
async fn log_entries_are_aggregated_and_listed() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let mut client = LoggingServiceV2Client::new(channel(sd.port()).await);

    let write = |insert_id: &str| WriteLogEntriesRequest {
        log_name: "projects/test-project/logs/server-accesslog-stackdriver".to_string(),
        labels: [("mesh_uid".to_string(), "proj-123".to_string())].into(),
        entries: vec![LogEntry {
            insert_id: insert_id.to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    client.write_log_entries(write("a")).await.unwrap();
    client.write_log_entries(write("b")).await.unwrap();

    let logs = client
        .list_logs(ListLogsRequest::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        logs.log_names,
        vec!["projects/test-project/logs/server-accesslog-stackdriver".to_string()]
    );

    eventually(|| sd.aggregator().log_texts().len() == 1).await;
    let text = sd.aggregator().log_texts().into_iter().next().unwrap();
    assert!(text.contains("proj-123"));
    sd.stop().await;
}

#[tokio::test]
async fn v2_spans_are_listed_through_v1() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let ch = channel(sd.port()).await;
    let mut writer = trace_v2::trace_service_client::TraceServiceClient::new(ch.clone());
    let mut reader = trace_v1::trace_service_client::TraceServiceClient::new(ch);

    let span = |id: &str, parent: &str, name: &str| trace_v2::Span {
        name: format!("projects/test-project/traces/abc/spans/{id}"),
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
            name: "projects/test-project".to_string(),
            spans: vec![span("01", "", "ingress"), span("02", "01", "egress")],
        })
        .await
        .unwrap();

    let listed = reader
        .list_traces(trace_v1::ListTracesRequest {
            project_id: "test-project".to_string(),
            filter: "+root:ingress".to_string(),
            view: trace_v1::list_traces_request::ViewType::Complete as i32,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.traces.len(), 1);
    assert_eq!(listed.traces[0].spans.len(), 2);

    let trace = reader
        .get_trace(trace_v1::GetTraceRequest {
            project_id: "test-project".to_string(),
            trace_id: "abc".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(trace.spans.len(), 2);

    let missing = reader
        .get_trace(trace_v1::GetTraceRequest {
            project_id: "test-project".to_string(),
            trace_id: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(missing.code(), tonic::Code::NotFound);
    sd.stop().await;
}

#[tokio::test]
async fn metric_type_filter_selects_golden_types() {
    init_tracing();
    let mut sd = FakeStackdriver::builder().start().await.unwrap();
    let mut client = MetricServiceClient::new(channel(sd.port()).await);
    client.create_time_series(create(MetricKind::Delta, 1)).await.unwrap();
    eventually(|| !sd.aggregator().metrics().is_empty()).await;

    let wanted: BTreeSet<String> = ["istio.io/service/client/request_count".to_string()].into();
    assert!(sd.aggregator().metric_texts(&wanted).is_empty());
    sd.stop().await;
}

#[tokio::test]
async fn otel_collector_counts_exports() {
    init_tracing();
    let collector = OtelCollector::new();
    let mut server = collector.start(0).await.unwrap();
    let mut client = LogsServiceClient::new(channel(server.port()).await);

    client.export(ExportLogsServiceRequest::default()).await.unwrap();
    client.export(ExportLogsServiceRequest::default()).await.unwrap();

    assert_eq!(collector.log_exports(), 2);
    assert_eq!(collector.metric_exports(), 0);
    server.stop().await;
}

#[tokio::test]
async fn sts_only_answers_the_exact_body() {
    init_tracing();
    let sts = SecureTokenService::new();
    let mut server = sts.start(0).await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());
    let http = reqwest::Client::new();

    let health = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let wrong = http
        .post(format!("{base}/token"))
        .body(r#"{"audience":"someone-else"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), reqwest::StatusCode::OK);
    assert!(wrong.text().await.unwrap().is_empty());
    assert_eq!(sts.issued(), 0);

    let right = http
        .post(format!("{base}/token"))
        .body(e2e_fakes::sts::EXPECTED_TOKEN_REQUEST)
        .send()
        .await
        .unwrap();
    assert_eq!(right.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = right.json().await.unwrap();
    assert_eq!(body["access_token"], EXPECTED_BEARER);
    assert_eq!(sts.issued(), 1);

    server.stop().await;
}

#[tokio::test]
async fn tls_fake_completes_handshake() {
    init_tracing();
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata/certs");
    let mut sd = FakeStackdriver::builder()
        .tls(e2e_fakes::TlsFiles::in_dir(&dir))
        .start()
        .await
        .unwrap();

    let root = std::fs::read(dir.join("root-cert.pem")).unwrap();
    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(root))
        .domain_name("localhost");
    let secure = Channel::from_shared(format!("https://127.0.0.1:{}", sd.port()))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();
    MetricServiceClient::new(secure)
        .create_time_series(create(MetricKind::Delta, 2))
        .await
        .unwrap();
    eventually(|| only_int(&sd) == Some(2)).await;

    let plaintext = async {
        match Channel::from_shared(format!("http://127.0.0.1:{}", sd.port()))
            .unwrap()
            .connect()
            .await
        {
            Err(_) => true,
            Ok(channel) => MetricServiceClient::new(channel)
                .create_time_series(create(MetricKind::Delta, 1))
                .await
                .is_err(),
        }
    };
    let rejected = tokio::time::timeout(Duration::from_secs(5), plaintext)
        .await
        .unwrap_or(true);
    assert!(rejected, "plaintext client reached a TLS-only fake");
    assert_eq!(sd.metrics().received().len(), 1);

    sd.stop().await;
}
