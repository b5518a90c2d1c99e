//! Stackdriver fake as a step, plus the steps that assert against it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use e2e_fakes::aggregate::{canonical_log_entry, canonical_text, canonical_time_series};
use e2e_fakes::{
    BearerAuth, FakeStackdriver, StackdriverState, TlsFiles, EXPECTED_BEARER, EXPECTED_PROJECT,
};
use e2e_proto::golden;
use e2e_proto::google::devtools::cloudtrace::v1::{list_traces_request::ViewType, ListTracesRequest};
use e2e_proto::google::logging::v2::LogEntry;
use e2e_proto::google::monitoring::v3::TimeSeries;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::params::testdata_path;
use crate::scenario::Step;
use crate::{Error, Params, Result};

const CHECK_ATTEMPTS: usize = 30;
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Shared pointer to the state of a running fake.
///
/// Assertion steps built from a [`Stackdriver`] hold one of these, so they
/// can live in the same scenario as the step that owns the fake.
#[derive(Debug, Clone, Default)]
pub struct StackdriverHandle(Arc<Mutex<Option<StackdriverState>>>);

impl StackdriverHandle {
    /// State of the running fake.
    pub fn state(&self) -> Result<StackdriverState> {
        self.0
            .lock()
            .map_err(|_| Error::NotStarted("stackdriver handle poisoned"))?
            .clone()
            .ok_or(Error::NotStarted("stackdriver fake is not running"))
    }

    fn set(&self, state: Option<StackdriverState>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Run the Stackdriver fake on `ports.sd`.
#[derive(Debug, Default)]
pub struct Stackdriver {
    port: Option<u16>,
    delay: Duration,
    tls: bool,
    bearer: bool,
    fake: Option<FakeStackdriver>,
    handle: StackdriverHandle,
}

impl Stackdriver {
    /// Plaintext fake without credential checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `port` instead.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Delay metric and log writes.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve TLS with the `certs` fixtures.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Require the fixed bearer token and project header.
    pub fn bearer(mut self, enabled: bool) -> Self {
        self.bearer = enabled;
        self
    }

    /// Handle for steps that read this fake.
    pub fn handle(&self) -> StackdriverHandle {
        self.handle.clone()
    }

    /// Step that waits for the given metric and log fixtures.
    pub fn check<M, L>(&self, metrics: M, logs: L) -> Check
    where
        M: IntoIterator,
        M::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Check::new(self.handle())
            .metrics(metrics)
            .logs(logs)
    }

    /// Step that waits for `want` traces matching `filter`.
    pub fn check_traces(&self, filter: impl Into<String>, want: usize) -> CheckTraces {
        CheckTraces {
            handle: self.handle(),
            filter: filter.into(),
            want,
            attempts: CHECK_ATTEMPTS,
            interval: CHECK_INTERVAL,
        }
    }

    /// Step that clears everything the fake received.
    pub fn reset(&self) -> ResetStackdriver {
        ResetStackdriver(self.handle())
    }
}

#[async_trait]
impl Step for Stackdriver {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let mut builder = FakeStackdriver::builder()
            .port(self.port.unwrap_or(params.ports.sd))
            .delay(self.delay);
        if self.tls {
            builder = builder.tls(TlsFiles::in_dir(testdata_path("certs")));
        }
        if self.bearer {
            builder = builder.auth(BearerAuth::new(EXPECTED_BEARER, EXPECTED_PROJECT));
        }
        let fake = builder.start().await?;
        self.handle.set(Some(fake.state().clone()));
        self.fake = Some(fake);
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(mut fake) = self.fake.take() {
            fake.stop().await;
        }
        self.handle.set(None);
    }
}

fn describe_diff(label: &str, want: &BTreeSet<String>, got: &BTreeSet<String>) -> Option<String> {
    if want == got {
        return None;
    }
    let mut out = format!("{label}:\n");
    for missing in want.difference(got) {
        out.push_str(&format!("  missing: {missing}\n"));
    }
    for extra in got.difference(want) {
        out.push_str(&format!("  unexpected: {extra}\n"));
    }
    Some(out)
}

/// Wait until the fake's aggregate equals a set of golden fixtures.
///
/// Fixtures are text-format protos under the testdata root, rendered
/// against the params. Metrics are compared only for the metric types the
/// fixtures mention; logs are compared only if fixtures are given.
#[derive(Debug, Clone)]
pub struct Check {
    handle: StackdriverHandle,
    metrics: Vec<String>,
    logs: Vec<String>,
    latency: bool,
    attempts: usize,
    interval: Duration,
}

impl Check {
    /// Check against the fake behind `handle`.
    pub fn new(handle: StackdriverHandle) -> Self {
        Self {
            handle,
            metrics: Vec::new(),
            logs: Vec::new(),
            latency: false,
            attempts: CHECK_ATTEMPTS,
            interval: CHECK_INTERVAL,
        }
    }

    /// `TimeSeries` fixtures.
    pub fn metrics<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.metrics.extend(paths.into_iter().map(Into::into));
        self
    }

    /// `LogEntry` fixtures.
    pub fn logs<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.logs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Also require every reported latency to stay under the configured
    /// bound.
    pub fn verify_latency(mut self, enabled: bool) -> Self {
        self.latency = enabled;
        self
    }

    /// Poll budget.
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Pause between polls.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn wanted_metrics(&self, params: &Params) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut types = BTreeSet::new();
        let mut texts = BTreeSet::new();
        for path in &self.metrics {
            let ts: TimeSeries = golden::parse_text(&params.load_test_data(path)?)?;
            if let Some(metric) = &ts.metric {
                types.insert(metric.r#type.clone());
            }
            texts.insert(canonical_text(&canonical_time_series(ts)));
        }
        Ok((types, texts))
    }

    fn wanted_logs(&self, params: &Params) -> Result<BTreeSet<String>> {
        self.logs
            .iter()
            .map(|path| {
                let entry: LogEntry = golden::parse_text(&params.load_test_data(path)?)?;
                Ok(canonical_text(&canonical_log_entry(entry)))
            })
            .collect()
    }
}

#[async_trait]
impl Step for Check {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let state = self.handle.state()?;
        let (types, want_metrics) = self.wanted_metrics(params)?;
        let want_logs = self.wanted_logs(params)?;
        let bound = DriverConfig::global().latency_bound();

        let mut diff = String::new();
        for attempt in 1..=self.attempts {
            let aggregator = state.aggregator();
            let mut problems = Vec::new();
            if !self.metrics.is_empty() {
                problems.extend(describe_diff(
                    "metrics",
                    &want_metrics,
                    &aggregator.metric_texts(&types),
                ));
            }
            if !self.logs.is_empty() {
                problems.extend(describe_diff("logs", &want_logs, &aggregator.log_texts()));
            }
            if self.latency {
                let slow: Vec<_> = aggregator
                    .latencies()
                    .into_iter()
                    .filter(|l| *l > bound)
                    .collect();
                if !slow.is_empty() {
                    problems.push(format!("latencies above {bound:?}: {slow:?}\n"));
                }
            }

            if problems.is_empty() {
                info!(attempt, "stackdriver check passed");
                return Ok(());
            }
            diff = problems.concat();
            debug!(attempt, "stackdriver check not satisfied yet");
            tokio::time::sleep(self.interval).await;
        }

        Err(Error::Timeout {
            what: "stackdriver telemetry".into(),
            attempts: self.attempts,
            diff,
        })
    }
}

/// Wait until a trace filter selects an exact number of traces.
#[derive(Debug, Clone)]
pub struct CheckTraces {
    handle: StackdriverHandle,
    filter: String,
    want: usize,
    attempts: usize,
    interval: Duration,
}

impl CheckTraces {
    /// Poll budget.
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Pause between polls.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Step for CheckTraces {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let state = self.handle.state()?;
        let request = ListTracesRequest {
            project_id: EXPECTED_PROJECT.to_string(),
            filter: params.fill(&self.filter)?,
            view: ViewType::Complete as i32,
            ..Default::default()
        };

        let mut got = 0;
        for attempt in 1..=self.attempts {
            got = state
                .traces()
                .list(&request)
                .map_err(|status| Error::parse("trace filter", status.message()))?
                .len();
            if got == self.want {
                debug!(attempt, traces = got, "trace check passed");
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }

        Err(Error::Timeout {
            what: format!("traces matching {:?}", request.filter),
            attempts: self.attempts,
            diff: format!("got {got} traces, want {}", self.want),
        })
    }
}

/// Clear the fake's received state.
#[derive(Debug, Clone)]
pub struct ResetStackdriver(StackdriverHandle);

#[async_trait]
impl Step for ResetStackdriver {
    async fn run(&mut self, _params: &mut Params) -> Result<()> {
        self.0.state()?.reset();
        Ok(())
    }
}
