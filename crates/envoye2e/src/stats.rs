//! Admin stats assertions.
//!
//! [`Stats`] polls the proxy admin endpoint in either the Prometheus text
//! format or the JSON format and applies one [`StatMatcher`] per metric
//! name. The first poll where every matcher agrees ends the step; when the
//! budget runs out the last disagreement is reported.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scenario::Step;
use crate::{Error, Params, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const POLL_ATTEMPTS: usize = 15;

/// Which admin endpoint to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
    /// `/stats/prometheus`.
    #[default]
    Prometheus,
    /// `/stats?format=json&usedonly`.
    Json,
}

impl StatsFormat {
    fn path(self) -> &'static str {
        match self {
            StatsFormat::Prometheus => "/stats/prometheus",
            StatsFormat::Json => "/stats?format=json&usedonly",
        }
    }
}

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    /// Monotonic counter.
    Counter,
    /// Point-in-time value.
    Gauge,
    /// Bucketed distribution.
    Histogram,
    /// Quantile summary. Its samples are kept as untyped families.
    Summary,
    /// No `# TYPE` line.
    #[default]
    Untyped,
}

impl MetricType {
    fn from_prometheus(kind: &str) -> Self {
        match kind {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "summary" => MetricType::Summary,
            _ => MetricType::Untyped,
        }
    }
}

/// One label of a sample.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelPair {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// A scalar sample value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleValue {
    /// The value.
    pub value: f64,
}

/// One histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Samples at or below `upper_bound`.
    pub cumulative_count: f64,
    /// Inclusive upper bound.
    pub upper_bound: f64,
}

/// Histogram data of one labelled series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Histogram {
    /// Number of samples.
    #[serde(default)]
    pub sample_count: f64,
    /// Sum of samples.
    #[serde(default)]
    pub sample_sum: f64,
    /// Buckets in ascending bound order.
    #[serde(default)]
    pub bucket: Vec<Bucket>,
}

/// One labelled series of a family.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metric {
    /// Labels, sorted by name.
    #[serde(default)]
    pub label: Vec<LabelPair>,
    /// Set for counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<SampleValue>,
    /// Set for gauges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge: Option<SampleValue>,
    /// Set for untyped samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untyped: Option<SampleValue>,
    /// Set for histograms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Histogram>,
}

/// A metric family as written in golden files.
///
/// ```yaml
/// name: envoy_cluster_upstream_rq
/// type: COUNTER
/// metric:
/// - counter:
///     value: 10
///   label:
///   - name: envoy_cluster_name
///     value: backend
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricFamily {
    /// Family name.
    pub name: String,
    /// Family type.
    #[serde(rename = "type", default)]
    pub kind: MetricType,
    /// Series, sorted by label set.
    #[serde(default)]
    pub metric: Vec<Metric>,
}

impl MetricFamily {
    fn empty(name: &str, kind: MetricType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            metric: Vec::new(),
        }
    }

    /// Sort labels, series and buckets so equal families compare equal.
    pub fn canonicalize(&mut self) {
        for metric in &mut self.metric {
            metric.label.sort();
            if let Some(histogram) = &mut metric.histogram {
                histogram
                    .bucket
                    .sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
            }
        }
        self.metric.sort_by(|a, b| a.label.cmp(&b.label));
    }

    fn series(&self, labels: &[LabelPair]) -> Option<&Metric> {
        self.metric.iter().find(|m| m.label == labels)
    }

    fn series_mut(&mut self, labels: Vec<LabelPair>) -> &mut Metric {
        let index = match self.metric.iter().position(|m| m.label == labels) {
            Some(index) => index,
            None => {
                self.metric.push(Metric {
                    label: labels,
                    ..Metric::default()
                });
                self.metric.len() - 1
            }
        };
        &mut self.metric[index]
    }
}

fn to_yaml<T: Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|e| format!("<unprintable: {e}>"))
}

/// Parsed admin output handed to matchers.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsDump {
    /// Families keyed by name.
    Prometheus(BTreeMap<String, MetricFamily>),
    /// Scalar stats keyed by name.
    Json(BTreeMap<String, f64>),
}

impl StatsDump {
    fn format(&self) -> StatsFormat {
        match self {
            StatsDump::Prometheus(_) => StatsFormat::Prometheus,
            StatsDump::Json(_) => StatsFormat::Json,
        }
    }

    /// Parse `body` as returned by the endpoint for `format`.
    pub fn parse(format: StatsFormat, body: &str) -> Result<Self> {
        match format {
            StatsFormat::Prometheus => parse_prometheus(body).map(StatsDump::Prometheus),
            StatsFormat::Json => parse_json_stats(body).map(StatsDump::Json),
        }
    }
}

struct Sample {
    name: String,
    labels: Vec<LabelPair>,
    value: f64,
}

fn parse_labels(mut s: &str) -> std::result::Result<(Vec<LabelPair>, &str), String> {
    let mut labels = Vec::new();
    loop {
        s = s.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if let Some(after) = s.strip_prefix('}') {
            return Ok((labels, after));
        }
        let eq = s.find('=').ok_or("unterminated label set")?;
        let name = s[..eq].trim().to_string();
        s = s[eq + 1..]
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| format!("value of label {name} is not quoted"))?;

        let mut value = String::new();
        let mut chars = s.char_indices();
        let end = loop {
            match chars.next() {
                Some((i, '"')) => break i,
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, c)) => value.push(c),
                    None => return Err(format!("dangling escape in label {name}")),
                },
                Some((_, c)) => value.push(c),
                None => return Err(format!("unterminated value of label {name}")),
            }
        };
        s = &s[end + 1..];
        labels.push(LabelPair { name, value });
    }
}

fn parse_sample(line: &str) -> std::result::Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or("missing value")?;
    let name = line[..name_end].to_string();
    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(body)?;
        labels = parsed;
        rest = after;
    }
    let raw = rest.split_whitespace().next().ok_or("missing value")?;
    let value = raw
        .parse::<f64>()
        .map_err(|e| format!("bad value {raw:?}: {e}"))?;
    Ok(Sample {
        name,
        labels,
        value,
    })
}

enum HistogramPart {
    Bucket,
    Sum,
    Count,
}

fn histogram_part<'a>(
    name: &'a str,
    types: &HashMap<String, MetricType>,
) -> Option<(&'a str, HistogramPart)> {
    [
        ("_bucket", HistogramPart::Bucket),
        ("_sum", HistogramPart::Sum),
        ("_count", HistogramPart::Count),
    ]
    .into_iter()
    .find_map(|(suffix, part)| {
        let base = name.strip_suffix(suffix)?;
        (types.get(base) == Some(&MetricType::Histogram)).then_some((base, part))
    })
}

/// Parse the Prometheus text exposition format.
pub fn parse_prometheus(text: &str) -> Result<BTreeMap<String, MetricFamily>> {
    let mut types: HashMap<String, MetricType> = HashMap::new();
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.split_whitespace();
            if parts.next() == Some("TYPE") {
                if let (Some(name), Some(kind)) = (parts.next(), parts.next()) {
                    let kind = MetricType::from_prometheus(kind);
                    types.insert(name.to_string(), kind);
                    families
                        .entry(name.to_string())
                        .or_insert_with(|| MetricFamily::empty(name, kind));
                }
            }
            continue;
        }

        let sample = parse_sample(line)
            .map_err(|message| Error::parse(format!("prometheus line {}", index + 1), message))?;

        if let Some((base, part)) = histogram_part(&sample.name, &types) {
            let family = families
                .entry(base.to_string())
                .or_insert_with(|| MetricFamily::empty(base, MetricType::Histogram));
            let mut labels = sample.labels;
            let bound = labels
                .iter()
                .position(|l| l.name == "le")
                .map(|i| labels.remove(i).value);
            labels.sort();
            let histogram = family
                .series_mut(labels)
                .histogram
                .get_or_insert_with(Histogram::default);
            match part {
                HistogramPart::Sum => histogram.sample_sum = sample.value,
                HistogramPart::Count => histogram.sample_count = sample.value,
                HistogramPart::Bucket => {
                    let raw = bound.unwrap_or_default();
                    let upper_bound = raw.parse::<f64>().map_err(|e| {
                        Error::parse(format!("prometheus line {}", index + 1), format!("bad le {raw:?}: {e}"))
                    })?;
                    histogram.bucket.push(Bucket {
                        cumulative_count: sample.value,
                        upper_bound,
                    });
                }
            }
            continue;
        }

        let kind = match types.get(&sample.name) {
            Some(MetricType::Counter) => MetricType::Counter,
            Some(MetricType::Gauge) => MetricType::Gauge,
            _ => MetricType::Untyped,
        };
        let family = families
            .entry(sample.name.clone())
            .or_insert_with(|| MetricFamily::empty(&sample.name, kind));
        if family.kind == MetricType::Summary {
            family.kind = MetricType::Untyped;
        }
        let mut labels = sample.labels;
        labels.sort();
        let value = Some(SampleValue {
            value: sample.value,
        });
        let series = family.series_mut(labels);
        match kind {
            MetricType::Counter => series.counter = value,
            MetricType::Gauge => series.gauge = value,
            _ => series.untyped = value,
        }
    }

    for family in families.values_mut() {
        family.canonicalize();
    }
    Ok(families)
}

#[derive(Deserialize)]
struct JsonStats {
    #[serde(default)]
    stats: Vec<serde_json::Value>,
}

/// Parse the admin JSON stats format, keeping scalar stats only.
pub fn parse_json_stats(text: &str) -> Result<BTreeMap<String, f64>> {
    let doc: JsonStats =
        serde_json::from_str(text).map_err(|e| Error::parse("admin JSON stats", e))?;
    Ok(doc
        .stats
        .iter()
        .filter_map(|stat| {
            let name = stat.get("name")?.as_str()?;
            let value = stat.get("value")?.as_f64()?;
            Some((name.to_string(), value))
        })
        .collect())
}

/// How one metric is checked.
pub trait StatMatcher: Send + Sync + fmt::Debug {
    /// Endpoint format this matcher understands, `None` for both.
    fn format(&self) -> Option<StatsFormat>;

    /// Load and render expectations. Called once per step run.
    fn prepare(&mut self, _params: &Params) -> Result<()> {
        Ok(())
    }

    /// Describe why `name` does not match, or succeed.
    fn check(&self, name: &str, dump: &StatsDump) -> std::result::Result<(), String>;
}

fn load_family(params: &Params, path: &str) -> Result<MetricFamily> {
    let text = params.load_test_data(path)?;
    let mut family: MetricFamily =
        serde_yaml::from_str(&text).map_err(|e| Error::parse(path.to_string(), e))?;
    family.canonicalize();
    Ok(family)
}

/// The whole family must equal a golden YAML file.
#[derive(Debug, Clone)]
pub struct ExactStat {
    path: String,
    want: Option<MetricFamily>,
}

impl ExactStat {
    /// Golden family at `path` under the testdata root, rendered against
    /// the params.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            want: None,
        }
    }
}

impl StatMatcher for ExactStat {
    fn format(&self) -> Option<StatsFormat> {
        Some(StatsFormat::Prometheus)
    }

    fn prepare(&mut self, params: &Params) -> Result<()> {
        self.want = Some(load_family(params, &self.path)?);
        Ok(())
    }

    fn check(&self, name: &str, dump: &StatsDump) -> std::result::Result<(), String> {
        let (StatsDump::Prometheus(families), Some(want)) = (dump, &self.want) else {
            return Err(format!("{name}: exact match needs prepared Prometheus stats"));
        };
        match families.get(name) {
            Some(got) if got == want => Ok(()),
            Some(got) => Err(format!(
                "{name}: got\n{}want\n{}",
                to_yaml(got),
                to_yaml(want)
            )),
            None => Err(format!("{name}: missing, want\n{}", to_yaml(want))),
        }
    }
}

/// Every series in a golden YAML file must be present with equal value.
/// Other series are ignored.
#[derive(Debug, Clone)]
pub struct PartialStat {
    path: String,
    want: Option<MetricFamily>,
}

impl PartialStat {
    /// Golden family at `path` under the testdata root.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            want: None,
        }
    }
}

impl StatMatcher for PartialStat {
    fn format(&self) -> Option<StatsFormat> {
        Some(StatsFormat::Prometheus)
    }

    fn prepare(&mut self, params: &Params) -> Result<()> {
        self.want = Some(load_family(params, &self.path)?);
        Ok(())
    }

    fn check(&self, name: &str, dump: &StatsDump) -> std::result::Result<(), String> {
        let (StatsDump::Prometheus(families), Some(want)) = (dump, &self.want) else {
            return Err(format!("{name}: partial match needs prepared Prometheus stats"));
        };
        let Some(got) = families.get(name) else {
            return Err(format!("{name}: missing"));
        };
        for series in &want.metric {
            match got.series(&series.label) {
                Some(found) if found == series => {}
                Some(found) => {
                    return Err(format!(
                        "{name}: series got\n{}want\n{}",
                        to_yaml(found),
                        to_yaml(series)
                    ))
                }
                None => return Err(format!("{name}: missing series\n{}", to_yaml(series))),
            }
        }
        Ok(())
    }
}

/// The metric must not be reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingStat;

impl StatMatcher for MissingStat {
    fn format(&self) -> Option<StatsFormat> {
        None
    }

    fn check(&self, name: &str, dump: &StatsDump) -> std::result::Result<(), String> {
        let present = match dump {
            StatsDump::Prometheus(families) => families.get(name).is_some_and(|f| !f.metric.is_empty()),
            StatsDump::Json(stats) => stats.contains_key(name),
        };
        if present {
            Err(format!("{name}: present, want absent"))
        } else {
            Ok(())
        }
    }
}

/// A scalar from the JSON endpoint must equal a value.
#[derive(Debug, Clone)]
pub struct JsonStat {
    value: String,
    want: Option<f64>,
}

impl JsonStat {
    /// Expected value, rendered against the params before parsing, so
    /// `"{{ n }}"` works inside a `Repeat`.
    pub fn new(value: impl ToString) -> Self {
        Self {
            value: value.to_string(),
            want: None,
        }
    }
}

impl StatMatcher for JsonStat {
    fn format(&self) -> Option<StatsFormat> {
        Some(StatsFormat::Json)
    }

    fn prepare(&mut self, params: &Params) -> Result<()> {
        let raw = params.fill(&self.value)?;
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| Error::parse(format!("stat value {raw:?}"), e))?;
        self.want = Some(value);
        Ok(())
    }

    fn check(&self, name: &str, dump: &StatsDump) -> std::result::Result<(), String> {
        let (StatsDump::Json(stats), Some(want)) = (dump, self.want) else {
            return Err(format!("{name}: value match needs prepared JSON stats"));
        };
        match stats.get(name) {
            Some(&got) if got == want => Ok(()),
            Some(got) => Err(format!("{name}: got {got}, want {want}")),
            None => Err(format!("{name}: missing, want {want}")),
        }
    }
}

/// Poll admin stats until every matcher agrees.
#[derive(Debug)]
pub struct Stats {
    admin_port: Option<u16>,
    format: StatsFormat,
    matchers: Vec<(String, Box<dyn StatMatcher>)>,
    attempts: usize,
    interval: Duration,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            admin_port: None,
            format: StatsFormat::default(),
            matchers: Vec::new(),
            attempts: POLL_ATTEMPTS,
            interval: POLL_INTERVAL,
        }
    }
}

impl Stats {
    /// Prometheus stats from `ports.client_admin`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the admin endpoint on `port`.
    pub fn admin_port(mut self, port: u16) -> Self {
        self.admin_port = Some(port);
        self
    }

    /// Endpoint format.
    pub fn format(mut self, format: StatsFormat) -> Self {
        self.format = format;
        self
    }

    /// Check metric `name` with `matcher`.
    pub fn matcher(mut self, name: impl Into<String>, matcher: impl StatMatcher + 'static) -> Self {
        self.matchers.push((name.into(), Box::new(matcher)));
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

    fn mismatches(&self, dump: &StatsDump) -> Vec<String> {
        self.matchers
            .iter()
            .filter_map(|(name, matcher)| matcher.check(name, dump).err())
            .collect()
    }

    async fn fetch(&self, client: &reqwest::Client, url: &str) -> std::result::Result<StatsDump, String> {
        let response = client.get(url).send().await.map_err(|e| e.to_string())?;
        let body = response.text().await.map_err(|e| e.to_string())?;
        StatsDump::parse(self.format, &body).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Step for Stats {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        for (name, matcher) in &mut self.matchers {
            if matcher.format().is_some_and(|f| f != self.format) {
                return Err(Error::Config(format!(
                    "matcher for {name} cannot read {:?} stats",
                    self.format
                )));
            }
            matcher.prepare(params)?;
        }

        let port = self.admin_port.unwrap_or(params.ports.client_admin);
        let url = format!("http://127.0.0.1:{port}{}", self.format.path());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| Error::http(&url, e))?;

        let mut last = Vec::new();
        for attempt in 1..=self.attempts {
            last = match self.fetch(&client, &url).await {
                Ok(dump) => {
                    debug_assert_eq!(dump.format(), self.format);
                    self.mismatches(&dump)
                }
                Err(e) => vec![e],
            };
            if last.is_empty() {
                debug!(port, attempt, "stats matched");
                return Ok(());
            }
            debug!(port, attempt, mismatches = last.len(), "stats not matched yet");
            tokio::time::sleep(self.interval).await;
        }

        Err(Error::Timeout {
            what: format!("stats on admin port {port}"),
            attempts: self.attempts,
            diff: last.join("\n"),
        })
    }
}
