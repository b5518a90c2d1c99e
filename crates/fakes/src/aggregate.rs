//! Single-writer aggregate of telemetry received by the Stackdriver fake.
//!
//! Every inbound metric or log request is funneled onto one channel. A single
//! task drains it and is the only writer of the aggregate; readers take the
//! same mutex through the accessors below.
//!
//! Received payloads are keyed by a canonical text form: the `Debug`
//! rendering of the message after volatile fields (timestamps, request ids,
//! byte counts, peer addresses) are cleared. Generated maps are `BTreeMap`, so
//! the rendering is deterministic and two payloads that differ only in
//! volatile fields collapse to one entry.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use e2e_proto::google::api::metric_descriptor::MetricKind;
use e2e_proto::google::logging::v2::LogEntry;
use e2e_proto::google::monitoring::v3::{typed_value, CreateTimeSeriesRequest, TimeSeries};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Log labels whose values change from request to request.
pub const VOLATILE_LOG_LABELS: &[&str] = &[
    "request_id",
    "source_ip",
    "source_port",
    "destination_ip",
    "destination_port",
    "upstream_host",
    "upstream_local_address",
    "connection_id",
    "total_sent_bytes",
    "total_received_bytes",
    "request_size",
    "response_size",
];

/// Suffix of metric types whose distributions carry request latency.
const LATENCY_METRIC_SUFFIX: &str = "response_latencies";

/// Payload sent from a gRPC handler to the aggregator.
#[derive(Debug, Clone)]
pub enum Ingest {
    /// A `CreateTimeSeries` request.
    Metrics(CreateTimeSeriesRequest),
    /// Log entries with request-level fields already merged in.
    Logs(Vec<LogEntry>),
}

/// Sending side of the ingest channel.
pub type IngestSender = mpsc::UnboundedSender<Ingest>;

#[derive(Debug, Default)]
struct State {
    metrics: BTreeMap<String, TimeSeries>,
    logs: BTreeSet<String>,
    latencies: Vec<Duration>,
}

/// Handle on the consumer task spawned by [`Aggregator::start`].
#[derive(Debug)]
pub struct Consumer {
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Consumer {
    /// Close the ingest channel and wait up to `timeout` for queued payloads
    /// to be applied. Senders that are still alive get an error afterwards.
    pub async fn drain(&mut self, timeout: Duration) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            warn!(?timeout, "aggregator did not drain in time");
            self.task.abort();
        }
    }
}

/// Aggregated view of received telemetry.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    state: Arc<Mutex<State>>,
}

impl Aggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the ingest channel and spawn the single consumer task.
    pub fn start(&self) -> (IngestSender, Consumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().consume(rx, close_rx));
        (
            tx,
            Consumer {
                close: Some(close_tx),
                task,
            },
        )
    }

    async fn consume(
        self,
        mut rx: mpsc::UnboundedReceiver<Ingest>,
        mut close: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => self.apply(item),
                    None => break,
                },
                _ = &mut close => {
                    // Refuse new payloads but fold in everything already queued.
                    rx.close();
                    while let Some(item) = rx.recv().await {
                        self.apply(item);
                    }
                    break;
                }
            }
        }
        debug!("ingest channel closed");
    }

    /// Fold one payload into the aggregate.
    pub fn apply(&self, item: Ingest) {
        let mut state = self.lock();
        match item {
            Ingest::Metrics(request) => {
                for ts in request.time_series {
                    if let Some(latency) = distribution_latency(&ts) {
                        state.latencies.push(latency);
                    }
                    let ts = canonical_time_series(ts);
                    let key = series_key(&ts);
                    trace!(key = %key, "aggregating time series");
                    let delta = ts.metric_kind() == MetricKind::Delta;
                    match state.metrics.entry(key) {
                        Entry::Occupied(mut existing) if delta => accumulate(existing.get_mut(), &ts),
                        Entry::Occupied(mut existing) => {
                            existing.insert(ts);
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(ts);
                        }
                    }
                }
            }
            Ingest::Logs(entries) => {
                for entry in entries {
                    if let Some(latency) = entry
                        .http_request
                        .as_ref()
                        .and_then(|r| r.latency)
                        .and_then(|d| Duration::try_from(d).ok())
                    {
                        state.latencies.push(latency);
                    }
                    state.logs.insert(canonical_text(&canonical_log_entry(entry)));
                }
            }
        }
    }

    /// Canonical text of every aggregated series whose metric type is in
    /// `types`. An empty filter selects everything.
    pub fn metric_texts(&self, types: &BTreeSet<String>) -> BTreeSet<String> {
        self.lock()
            .metrics
            .values()
            .filter(|ts| types.is_empty() || types.contains(metric_type(ts)))
            .map(canonical_text)
            .collect()
    }

    /// The aggregated series, keyed by series identity.
    pub fn metrics(&self) -> BTreeMap<String, TimeSeries> {
        self.lock().metrics.clone()
    }

    /// Canonical text of every received log entry.
    pub fn log_texts(&self) -> BTreeSet<String> {
        self.lock().logs.clone()
    }

    /// Latencies observed in log entries and latency distributions.
    pub fn latencies(&self) -> Vec<Duration> {
        self.lock().latencies.clone()
    }

    /// Drop everything received so far.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.metrics.clear();
        state.logs.clear();
        state.latencies.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("aggregate lock poisoned")
    }
}

/// Deterministic text form of a message.
pub fn canonical_text<T: std::fmt::Debug>(msg: &T) -> String {
    format!("{msg:?}")
}

/// Clear volatile fields of a time series.
///
/// Point intervals are dropped. Distributions keep their count, bucket
/// options and, except for latency metrics, bucket counts.
pub fn canonical_time_series(mut ts: TimeSeries) -> TimeSeries {
    let latency = metric_type(&ts).ends_with(LATENCY_METRIC_SUFFIX);
    ts.metadata = None;
    for point in &mut ts.points {
        point.interval = None;
        if let Some(typed_value::Value::DistributionValue(d)) =
            point.value.as_mut().and_then(|v| v.value.as_mut())
        {
            d.mean = 0.0;
            d.sum_of_squared_deviation = 0.0;
            d.range = None;
            d.exemplars.clear();
            if latency {
                d.bucket_counts.clear();
            }
        }
    }
    ts
}

/// Clear volatile fields of a log entry.
pub fn canonical_log_entry(mut entry: LogEntry) -> LogEntry {
    entry.timestamp = None;
    entry.receive_timestamp = None;
    entry.insert_id.clear();
    entry.trace.clear();
    entry.span_id.clear();
    entry.trace_sampled = false;
    if let Some(req) = entry.http_request.as_mut() {
        req.latency = None;
        req.request_size = 0;
        req.response_size = 0;
        req.remote_ip.clear();
        req.server_ip.clear();
    }
    for label in VOLATILE_LOG_LABELS {
        entry.labels.remove(*label);
    }
    entry
}

fn metric_type(ts: &TimeSeries) -> &str {
    ts.metric.as_ref().map(|m| m.r#type.as_str()).unwrap_or_default()
}

/// Identity of a series: everything but its points.
fn series_key(ts: &TimeSeries) -> String {
    let mut header = ts.clone();
    header.points.clear();
    canonical_text(&header)
}

fn distribution_latency(ts: &TimeSeries) -> Option<Duration> {
    if !metric_type(ts).ends_with(LATENCY_METRIC_SUFFIX) {
        return None;
    }
    ts.points.iter().find_map(|p| match p.value.as_ref()?.value.as_ref()? {
        typed_value::Value::DistributionValue(d) if d.count > 0 && d.mean.is_finite() => {
            Some(Duration::from_secs_f64(d.mean.max(0.0) / 1000.0))
        }
        _ => None,
    })
}

fn accumulate(into: &mut TimeSeries, from: &TimeSeries) {
    let incoming = from.points.first().and_then(|p| p.value.as_ref()).and_then(|v| v.value.as_ref());
    let current = into
        .points
        .first_mut()
        .and_then(|p| p.value.as_mut())
        .and_then(|v| v.value.as_mut());

    match (current, incoming) {
        (Some(acc), Some(add)) => add_value(acc, add),
        _ => *into = from.clone(),
    }
}

fn add_value(acc: &mut typed_value::Value, add: &typed_value::Value) {
    use typed_value::Value;

    match (acc, add) {
        (Value::Int64Value(a), Value::Int64Value(b)) => *a += b,
        (Value::DoubleValue(a), Value::DoubleValue(b)) => *a += b,
        (Value::DistributionValue(a), Value::DistributionValue(b)) => {
            a.count += b.count;
            if a.bucket_counts.len() < b.bucket_counts.len() {
                a.bucket_counts.resize(b.bucket_counts.len(), 0);
            }
            for (slot, n) in a.bucket_counts.iter_mut().zip(&b.bucket_counts) {
                *slot += n;
            }
        }
        (acc, add) => *acc = add.clone(),
    }
}
