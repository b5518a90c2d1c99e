//! Fake Cloud Trace service.
//!
//! Spans arrive through the v2 API (`BatchWriteSpans`, `CreateSpan`) or the
//! v1 `PatchTraces` call and are stored in v1 shape, grouped by trace id.
//! The v1 `ListTraces` call supports the filter grammar:
//!
//! - `root:NAME` matches the name of a root span (no parent)
//! - `span:NAME` matches the name of any span
//! - `label:KEY:VALUE` or `KEY:VALUE` matches a span label
//! - a bare `NAME` is shorthand for `root:NAME`
//!
//! Terms are separated by whitespace and must all match. A leading `+`
//! requires an exact match; otherwise values match by prefix. A trace is
//! kept only if one of its spans overlaps the request's time window.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use e2e_proto::google::devtools::cloudtrace::v1::{
    self as v1, list_traces_request::ViewType, trace_span::SpanKind as V1Kind, trace_service_server,
};
use e2e_proto::google::devtools::cloudtrace::v2::{
    self as v2, attribute_value, span::SpanKind as V2Kind,
};
use once_cell::sync::Lazy;
use prost_types::Timestamp;
use regex::Regex;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

static SPAN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^projects/([^/]+)/traces/([^/]+)/spans/(.+)$").expect("valid span name regex")
});

/// Trace service speaking both API versions over one store.
#[derive(Debug, Clone, Default)]
pub struct TraceServer {
    traces: Arc<Mutex<BTreeMap<String, v1::Trace>>>,
}

impl TraceServer {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// v1 service wrapper.
    pub fn v1_service(&self) -> trace_service_server::TraceServiceServer<Self> {
        trace_service_server::TraceServiceServer::new(self.clone())
    }

    /// v2 service wrapper.
    pub fn v2_service(&self) -> v2::trace_service_server::TraceServiceServer<Self> {
        v2::trace_service_server::TraceServiceServer::new(self.clone())
    }

    /// Every stored trace, ordered by trace id.
    pub fn traces(&self) -> Vec<v1::Trace> {
        self.lock().values().cloned().collect()
    }

    /// Traces selected by a `ListTraces` request.
    pub fn list(&self, request: &v1::ListTracesRequest) -> Result<Vec<v1::Trace>, Status> {
        let terms = parse_filter(&request.filter)?;
        let window = (request.start_time, request.end_time);
        let view = request.view();

        Ok(self
            .lock()
            .values()
            .filter(|t| request.project_id.is_empty() || t.project_id == request.project_id)
            .filter(|t| in_window(t, window))
            .filter(|t| terms.iter().all(|term| term.matches(t)))
            .map(|t| apply_view(t, view))
            .collect())
    }

    /// Drop every stored trace.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn store(&self, project_id: &str, trace_id: &str, spans: Vec<v1::TraceSpan>) {
        let mut traces = self.lock();
        let trace = traces
            .entry(trace_id.to_string())
            .or_insert_with(|| v1::Trace {
                project_id: project_id.to_string(),
                trace_id: trace_id.to_string(),
                spans: Vec::new(),
            });
        for span in spans {
            match trace.spans.iter_mut().find(|s| s.span_id == span.span_id) {
                Some(existing) => *existing = span,
                None => trace.spans.push(span),
            }
        }
    }

    fn store_v2(&self, span: v2::Span) -> Result<(), Status> {
        let (project, trace_id, converted) = convert_span(span)?;
        debug!(trace = %trace_id, span = converted.span_id, name = %converted.name, "received span");
        self.store(&project, &trace_id, vec![converted]);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, v1::Trace>> {
        self.traces.lock().expect("trace lock poisoned")
    }
}

/// Convert a v2 span into its v1 shape.
///
/// Returns the project and trace id parsed from the span resource name.
pub fn convert_span(span: v2::Span) -> Result<(String, String, v1::TraceSpan), Status> {
    let caps = SPAN_NAME
        .captures(&span.name)
        .ok_or_else(|| Status::invalid_argument(format!("malformed span name {:?}", span.name)))?;
    let project = caps[1].to_string();
    let trace_id = caps[2].to_string();

    let span_id_hex = if span.span_id.is_empty() { &caps[3] } else { span.span_id.as_str() };
    let span_id = parse_hex_id(span_id_hex)?;
    let parent_span_id = if span.parent_span_id.is_empty() {
        0
    } else {
        parse_hex_id(&span.parent_span_id)?
    };

    let kind = match span.span_kind() {
        V2Kind::Server => V1Kind::RpcServer,
        V2Kind::Client => V1Kind::RpcClient,
        _ => V1Kind::Unspecified,
    };

    let labels = span
        .attributes
        .map(|a| {
            a.attribute_map
                .into_iter()
                .filter_map(|(key, value)| Some((key, attribute_text(value.value?))))
                .collect()
        })
        .unwrap_or_default();

    Ok((
        project,
        trace_id,
        v1::TraceSpan {
            span_id,
            kind: kind as i32,
            name: span.display_name.map(|n| n.value).unwrap_or_default(),
            start_time: span.start_time,
            end_time: span.end_time,
            parent_span_id,
            labels,
        },
    ))
}

fn parse_hex_id(hex: &str) -> Result<u64, Status> {
    u64::from_str_radix(hex, 16)
        .map_err(|e| Status::invalid_argument(format!("invalid span id {hex:?}: {e}")))
}

fn attribute_text(value: attribute_value::Value) -> String {
    match value {
        attribute_value::Value::StringValue(s) => s.value,
        attribute_value::Value::IntValue(n) => n.to_string(),
        attribute_value::Value::BoolValue(b) => b.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    value: String,
    exact: bool,
}

impl Pattern {
    fn matches(&self, candidate: &str) -> bool {
        if self.exact {
            candidate == self.value
        } else {
            candidate.starts_with(&self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Root(Pattern),
    Span(Pattern),
    Label { key: String, value: Pattern },
}

impl Term {
    fn matches(&self, trace: &v1::Trace) -> bool {
        match self {
            Term::Root(p) => trace
                .spans
                .iter()
                .any(|s| s.parent_span_id == 0 && p.matches(&s.name)),
            Term::Span(p) => trace.spans.iter().any(|s| p.matches(&s.name)),
            Term::Label { key, value } => trace
                .spans
                .iter()
                .any(|s| s.labels.get(key).is_some_and(|v| value.matches(v))),
        }
    }
}

fn parse_filter(filter: &str) -> Result<Vec<Term>, Status> {
    filter.split_whitespace().map(parse_term).collect()
}

fn parse_term(raw: &str) -> Result<Term, Status> {
    let (exact, body) = match raw.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let pattern = |value: &str| Pattern {
        value: value.to_string(),
        exact,
    };

    if let Some(name) = body.strip_prefix("root:") {
        return Ok(Term::Root(pattern(name)));
    }
    if let Some(name) = body.strip_prefix("span:") {
        return Ok(Term::Span(pattern(name)));
    }
    let label = body.strip_prefix("label:").unwrap_or(body);
    match label.split_once(':') {
        Some((key, value)) if !key.is_empty() => Ok(Term::Label {
            key: key.to_string(),
            value: pattern(value),
        }),
        Some(_) => Err(Status::invalid_argument(format!("invalid filter term {raw:?}"))),
        None => Ok(Term::Root(pattern(body))),
    }
}

fn ts_key(ts: &Timestamp) -> (i64, i32) {
    (ts.seconds, ts.nanos)
}

fn in_window(trace: &v1::Trace, (start, end): (Option<Timestamp>, Option<Timestamp>)) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    trace.spans.iter().any(|span| {
        let begins_before_end = match (&end, &span.start_time) {
            (Some(end), Some(s)) => ts_key(s) <= ts_key(end),
            _ => true,
        };
        let ends_after_start = match (&start, &span.end_time) {
            (Some(start), Some(e)) => ts_key(e) >= ts_key(start),
            _ => true,
        };
        begins_before_end && ends_after_start
    })
}

fn apply_view(trace: &v1::Trace, view: ViewType) -> v1::Trace {
    let mut trace = trace.clone();
    match view {
        ViewType::Minimal => trace.spans.clear(),
        ViewType::Rootspan => trace.spans.retain(|s| s.parent_span_id == 0),
        ViewType::Complete | ViewType::Unspecified => {}
    }
    trace
}

#[async_trait]
impl trace_service_server::TraceService for TraceServer {
    async fn list_traces(
        &self,
        request: Request<v1::ListTracesRequest>,
    ) -> Result<Response<v1::ListTracesResponse>, Status> {
        let traces = self.list(request.get_ref())?;
        Ok(Response::new(v1::ListTracesResponse {
            traces,
            next_page_token: String::new(),
        }))
    }

    async fn get_trace(
        &self,
        request: Request<v1::GetTraceRequest>,
    ) -> Result<Response<v1::Trace>, Status> {
        let request = request.into_inner();
        self.lock()
            .get(&request.trace_id)
            .filter(|t| request.project_id.is_empty() || t.project_id == request.project_id)
            .cloned()
            .map(Response::new)
            .ok_or_else(|| Status::not_found(format!("trace {} not found", request.trace_id)))
    }

    async fn patch_traces(
        &self,
        request: Request<v1::PatchTracesRequest>,
    ) -> Result<Response<()>, Status> {
        let request = request.into_inner();
        for trace in request.traces.map(|t| t.traces).unwrap_or_default() {
            let project = if trace.project_id.is_empty() {
                request.project_id.as_str()
            } else {
                trace.project_id.as_str()
            };
            self.store(project, &trace.trace_id, trace.spans);
        }
        Ok(Response::new(()))
    }
}

#[async_trait]
impl v2::trace_service_server::TraceService for TraceServer {
    async fn batch_write_spans(
        &self,
        request: Request<v2::BatchWriteSpansRequest>,
    ) -> Result<Response<()>, Status> {
        let request = request.into_inner();
        debug!(project = %request.name, spans = request.spans.len(), "received span batch");
        for span in request.spans {
            if let Err(status) = self.store_v2(span) {
                warn!(error = %status.message(), "rejecting span batch");
                return Err(status);
            }
        }
        Ok(Response::new(()))
    }

    async fn create_span(&self, request: Request<v2::Span>) -> Result<Response<v2::Span>, Status> {
        let span = request.into_inner();
        self.store_v2(span.clone())?;
        Ok(Response::new(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v2_span(trace: &str, id: &str, parent: &str, name: &str, start: i64, end: i64) -> v2::Span {
        v2::Span {
            name: format!("projects/test-project/traces/{trace}/spans/{id}"),
            span_id: id.to_string(),
            parent_span_id: parent.to_string(),
            display_name: Some(v2::TruncatableString {
                value: name.to_string(),
                truncated_byte_count: 0,
            }),
            start_time: Some(Timestamp { seconds: start, nanos: 0 }),
            end_time: Some(Timestamp { seconds: end, nanos: 0 }),
            attributes: Some(v2::span::Attributes {
                attribute_map: [
                    (
                        "http.method".to_string(),
                        v2::AttributeValue {
                            value: Some(attribute_value::Value::StringValue(v2::TruncatableString {
                                value: "GET".to_string(),
                                truncated_byte_count: 0,
                            })),
                        },
                    ),
                    (
                        "http.status_code".to_string(),
                        v2::AttributeValue {
                            value: Some(attribute_value::Value::IntValue(200)),
                        },
                    ),
                ]
                .into(),
                dropped_attributes_count: 0,
            }),
            span_kind: V2Kind::Server as i32,
            ..Default::default()
        }
    }

    fn seeded() -> TraceServer {
        let server = TraceServer::new();
        server.store_v2(v2_span("t1", "0a", "", "ingress.frontend", 10, 20)).unwrap();
        server.store_v2(v2_span("t1", "0b", "0a", "egress.backend", 12, 18)).unwrap();
        server.store_v2(v2_span("t2", "1a", "", "ingress.checkout", 100, 110)).unwrap();
        server
    }

    fn list(server: &TraceServer, filter: &str) -> Vec<String> {
        let request = v1::ListTracesRequest {
            filter: filter.to_string(),
            view: ViewType::Complete as i32,
            ..Default::default()
        };
        server.list(&request).unwrap().into_iter().map(|t| t.trace_id).collect()
    }

    #[test]
    fn converts_v2_span() {
        let (project, trace, span) =
            convert_span(v2_span("abc", "00f0", "000a", "outbound", 1, 2)).unwrap();
        assert_eq!(project, "test-project");
        assert_eq!(trace, "abc");
        assert_eq!(span.span_id, 0xf0);
        assert_eq!(span.parent_span_id, 0x0a);
        assert_eq!(span.kind(), V1Kind::RpcServer);
        assert_eq!(span.name, "outbound");
        assert_eq!(span.labels["http.method"], "GET");
        assert_eq!(span.labels["http.status_code"], "200");
    }

    #[test]
    fn rejects_malformed_name() {
        let mut span = v2_span("abc", "01", "", "x", 1, 2);
        span.name = "projects/p/spans/01".to_string();
        assert_eq!(convert_span(span).unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn spans_group_by_trace() {
        let traces = seeded().traces();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].spans.len(), 2);
        assert_eq!(traces[1].spans.len(), 1);
    }

    #[test]
    fn root_filter_only_considers_parentless_spans() {
        let server = seeded();
        assert_eq!(list(&server, "root:ingress"), vec!["t1", "t2"]);
        assert!(list(&server, "root:egress").is_empty());
        assert_eq!(list(&server, "span:egress"), vec!["t1"]);
        assert_eq!(list(&server, "ingress.check"), vec!["t2"]);
    }

    #[test]
    fn plus_requires_exact_match() {
        let server = seeded();
        assert!(list(&server, "+root:ingress").is_empty());
        assert_eq!(list(&server, "+root:ingress.frontend"), vec!["t1"]);
        assert_eq!(list(&server, "+http.method:GET"), vec!["t1", "t2"]);
        assert!(list(&server, "+http.method:GE").is_empty());
    }

    #[test]
    fn label_terms_and_conjunction() {
        let server = seeded();
        assert_eq!(list(&server, "label:http.status_code:2"), vec!["t1", "t2"]);
        assert_eq!(list(&server, "http.status_code:200 span:egress"), vec!["t1"]);
    }

    #[test]
    fn time_window_keeps_overlapping_traces() {
        let server = seeded();
        let request = |start: i64, end: i64| v1::ListTracesRequest {
            start_time: Some(Timestamp { seconds: start, nanos: 0 }),
            end_time: Some(Timestamp { seconds: end, nanos: 0 }),
            ..Default::default()
        };
        let ids = |r: v1::ListTracesRequest| -> Vec<String> {
            server.list(&r).unwrap().into_iter().map(|t| t.trace_id).collect()
        };
        assert_eq!(ids(request(15, 50)), vec!["t1"]);
        assert_eq!(ids(request(105, 200)), vec!["t2"]);
        assert!(ids(request(30, 90)).is_empty());
    }

    #[test]
    fn rootspan_view_drops_children() {
        let server = seeded();
        let request = v1::ListTracesRequest {
            view: ViewType::Rootspan as i32,
            filter: "+root:ingress.frontend".to_string(),
            ..Default::default()
        };
        let traces = server.list(&request).unwrap();
        assert_eq!(traces[0].spans.len(), 1);
        assert_eq!(traces[0].spans[0].name, "ingress.frontend");
    }

    #[test]
    fn rewriting_a_span_replaces_it() {
        let server = seeded();
        server.store_v2(v2_span("t1", "0b", "0a", "egress.renamed", 12, 18)).unwrap();
        let traces = server.traces();
        assert_eq!(traces[0].spans.len(), 2);
        assert!(traces[0].spans.iter().any(|s| s.name == "egress.renamed"));
    }
}
