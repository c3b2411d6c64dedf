//! Operational counters and a query surface over a rolling window
//!
//! Counter updates are a single mutex touch per event; nothing is held
//! across an await. Ring rotation is lazy: stale buckets are skipped on read
//! and reclaimed on the next write to their slot, never by a timer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

const RING_SECONDS: u64 = 60;

/// Request lifecycle events the hub counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsEvent {
    Enqueued,
    Started,
    Succeeded,
    Failed,
    Retried,
    RateLimited,
    Deduplicated,
    Debounced,
    HedgeLaunched,
    HedgeWon,
}

/// Monotonic event counters since construction or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsCounters {
    pub enqueued: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub deduplicated: u64,
    pub debounced: u64,
    pub hedges_launched: u64,
    pub hedges_won: u64,
}

/// One completed request, as recorded into the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSample {
    /// Host + path.
    pub endpoint: String,
    pub method: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error_kind: Option<String>,
}

/// Metric selected by a stats query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatsMetric {
    Count,
    Rate,
    DurationMean,
    DurationMedian,
    DurationP95,
    DurationP99,
    ErrorBreakdown,
    RetryDistribution,
}

/// Dimension used for grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatsDimension {
    Endpoint,
    Method,
    Status,
    ErrorKind,
}

/// Time range a query aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeWindow {
    SinceStart,
    Rolling60s,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::SinceStart
    }
}

/// Sample predicate for queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsFilter {
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub error_kind: Option<String>,
}

impl StatsFilter {
    fn matches(&self, sample: &RequestSample) -> bool {
        if let Some(endpoint) = &self.endpoint {
            if &sample.endpoint != endpoint {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !sample.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if sample.status != Some(status) {
                return false;
            }
        }
        if let Some(error_kind) = &self.error_kind {
            if sample.error_kind.as_deref() != Some(error_kind.as_str()) {
                return false;
            }
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.method.is_none()
            && self.status.is_none()
            && self.error_kind.is_none()
    }
}

/// A stats query.
#[derive(Debug, Clone)]
pub struct StatsQuery {
    pub metric: StatsMetric,
    pub group_by: Option<StatsDimension>,
    pub filter: Option<StatsFilter>,
    pub time_window: TimeWindow,
}

impl StatsQuery {
    pub fn metric(metric: StatsMetric) -> Self {
        Self {
            metric,
            group_by: None,
            filter: None,
            time_window: TimeWindow::default(),
        }
    }

    pub fn group_by(mut self, dimension: StatsDimension) -> Self {
        self.group_by = Some(dimension);
        self
    }

    pub fn filter(mut self, filter: StatsFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.time_window = window;
        self
    }
}

/// Query result: a scalar, grouped values, or both zeroed when nothing
/// matched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsReport {
    pub value: Option<f64>,
    pub groups: BTreeMap<String, f64>,
}

/// Counter snapshot for export.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub counters: StatsCounters,
    pub uptime_ms: u64,
}

struct RingBucket {
    epoch_sec: u64,
    samples: Vec<RequestSample>,
}

#[derive(Default)]
struct Cumulative {
    completed: u64,
    duration_sum_ms: u64,
    by_endpoint: HashMap<String, u64>,
    by_method: HashMap<String, u64>,
    by_status: HashMap<u16, u64>,
    by_error_kind: HashMap<String, u64>,
    retry_histogram: HashMap<u32, u64>,
}

struct StatsInner {
    started_at: Instant,
    counters: StatsCounters,
    ring: Vec<RingBucket>,
    cumulative: Cumulative,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: StatsCounters::default(),
            ring: (0..RING_SECONDS)
                .map(|_| RingBucket {
                    epoch_sec: u64::MAX,
                    samples: Vec::new(),
                })
                .collect(),
            cumulative: Cumulative::default(),
        }
    }

    fn now_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn push_sample(&mut self, sample: RequestSample) {
        let now_sec = self.now_sec();
        let idx = (now_sec % RING_SECONDS) as usize;
        let bucket = &mut self.ring[idx];
        if bucket.epoch_sec != now_sec {
            bucket.samples.clear();
            bucket.epoch_sec = now_sec;
        }
        bucket.samples.push(sample);
    }

    /// Samples still inside the rolling window, filtered.
    fn window_samples(&self, filter: Option<&StatsFilter>) -> Vec<&RequestSample> {
        let now_sec = self.now_sec();
        let oldest = now_sec.saturating_sub(RING_SECONDS - 1);
        self.ring
            .iter()
            .filter(|bucket| bucket.epoch_sec >= oldest && bucket.epoch_sec <= now_sec)
            .flat_map(|bucket| bucket.samples.iter())
            .filter(|sample| filter.map(|f| f.matches(sample)).unwrap_or(true))
            .collect()
    }
}

/// Per-client stats accumulator.
pub struct StatsHub {
    enabled: AtomicBool,
    inner: Mutex<StatsInner>,
}

impl StatsHub {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            inner: Mutex::new(StatsInner::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Count one lifecycle event.
    pub fn event(&self, event: StatsEvent) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let counters = &mut inner.counters;
        match event {
            StatsEvent::Enqueued => counters.enqueued += 1,
            StatsEvent::Started => counters.started += 1,
            StatsEvent::Succeeded => counters.succeeded += 1,
            StatsEvent::Failed => counters.failed += 1,
            StatsEvent::Retried => counters.retried += 1,
            StatsEvent::RateLimited => counters.rate_limited += 1,
            StatsEvent::Deduplicated => counters.deduplicated += 1,
            StatsEvent::Debounced => counters.debounced += 1,
            StatsEvent::HedgeLaunched => counters.hedges_launched += 1,
            StatsEvent::HedgeWon => counters.hedges_won += 1,
        }
    }

    /// Record a completed request into the cumulative aggregates and the
    /// rolling window.
    pub fn record_outcome(&self, sample: RequestSample) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let cumulative = &mut inner.cumulative;
        cumulative.completed += 1;
        cumulative.duration_sum_ms += sample.duration_ms;
        *cumulative
            .by_endpoint
            .entry(sample.endpoint.clone())
            .or_insert(0) += 1;
        *cumulative
            .by_method
            .entry(sample.method.clone())
            .or_insert(0) += 1;
        if let Some(status) = sample.status {
            *cumulative.by_status.entry(status).or_insert(0) += 1;
        }
        if let Some(kind) = &sample.error_kind {
            *cumulative.by_error_kind.entry(kind.clone()).or_insert(0) += 1;
        }
        *cumulative.retry_histogram.entry(sample.attempts).or_insert(0) += 1;
        inner.push_sample(sample);
    }

    pub fn counters(&self) -> StatsCounters {
        self.inner.lock().unwrap().counters.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap();
        StatsSnapshot {
            counters: inner.counters.clone(),
            uptime_ms: inner.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Clear all counters, aggregates, and the ring.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = StatsInner::new();
    }

    /// Aggregate over the selected window.
    ///
    /// Plain counts, rates, means, and the breakdown metrics over
    /// `SinceStart` use cumulative aggregates; grouped or filtered duration
    /// queries and all percentiles are computed from the rolling window's
    /// raw samples.
    pub fn query(&self, q: &StatsQuery) -> StatsReport {
        let inner = self.inner.lock().unwrap();
        let filter = q.filter.as_ref().filter(|f| !f.is_empty());

        match q.metric {
            StatsMetric::Count => {
                if let Some(dimension) = q.group_by {
                    StatsReport {
                        value: None,
                        groups: grouped_counts(&inner, q.time_window, dimension, filter),
                    }
                } else {
                    let count = match (q.time_window, filter) {
                        (TimeWindow::SinceStart, None) => inner.cumulative.completed as f64,
                        _ => inner.window_samples(filter).len() as f64,
                    };
                    StatsReport {
                        value: Some(count),
                        groups: BTreeMap::new(),
                    }
                }
            }
            StatsMetric::Rate => {
                let (count, seconds) = match (q.time_window, filter) {
                    (TimeWindow::SinceStart, None) => (
                        inner.cumulative.completed as f64,
                        inner.started_at.elapsed().as_secs_f64(),
                    ),
                    (TimeWindow::SinceStart, Some(f)) => (
                        inner.window_samples(Some(f)).len() as f64,
                        inner.started_at.elapsed().as_secs_f64(),
                    ),
                    (TimeWindow::Rolling60s, f) => (
                        inner.window_samples(f).len() as f64,
                        inner
                            .started_at
                            .elapsed()
                            .as_secs_f64()
                            .min(RING_SECONDS as f64),
                    ),
                };
                StatsReport {
                    value: Some(count / seconds.max(0.001)),
                    groups: BTreeMap::new(),
                }
            }
            StatsMetric::DurationMean => {
                let value = match (q.time_window, filter, q.group_by) {
                    (TimeWindow::SinceStart, None, None) => {
                        if inner.cumulative.completed == 0 {
                            0.0
                        } else {
                            inner.cumulative.duration_sum_ms as f64
                                / inner.cumulative.completed as f64
                        }
                    }
                    _ => {
                        let samples = inner.window_samples(filter);
                        if samples.is_empty() {
                            0.0
                        } else {
                            samples.iter().map(|s| s.duration_ms as f64).sum::<f64>()
                                / samples.len() as f64
                        }
                    }
                };
                StatsReport {
                    value: Some(value),
                    groups: BTreeMap::new(),
                }
            }
            StatsMetric::DurationMedian => percentile_report(&inner, filter, 50.0),
            StatsMetric::DurationP95 => percentile_report(&inner, filter, 95.0),
            StatsMetric::DurationP99 => percentile_report(&inner, filter, 99.0),
            StatsMetric::ErrorBreakdown => {
                let groups = match (q.time_window, filter) {
                    (TimeWindow::SinceStart, None) => inner
                        .cumulative
                        .by_error_kind
                        .iter()
                        .map(|(k, v)| (k.clone(), *v as f64))
                        .collect(),
                    _ => {
                        let mut groups: BTreeMap<String, f64> = BTreeMap::new();
                        for sample in inner.window_samples(filter) {
                            if let Some(kind) = &sample.error_kind {
                                *groups.entry(kind.clone()).or_insert(0.0) += 1.0;
                            }
                        }
                        groups
                    }
                };
                StatsReport {
                    value: None,
                    groups,
                }
            }
            StatsMetric::RetryDistribution => {
                let groups = match (q.time_window, filter) {
                    (TimeWindow::SinceStart, None) => inner
                        .cumulative
                        .retry_histogram
                        .iter()
                        .map(|(attempts, count)| (attempts.to_string(), *count as f64))
                        .collect(),
                    _ => {
                        let mut groups: BTreeMap<String, f64> = BTreeMap::new();
                        for sample in inner.window_samples(filter) {
                            *groups.entry(sample.attempts.to_string()).or_insert(0.0) += 1.0;
                        }
                        groups
                    }
                };
                StatsReport {
                    value: None,
                    groups,
                }
            }
        }
    }
}

fn dimension_value(sample: &RequestSample, dimension: StatsDimension) -> String {
    match dimension {
        StatsDimension::Endpoint => sample.endpoint.clone(),
        StatsDimension::Method => sample.method.clone(),
        StatsDimension::Status => sample
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string()),
        StatsDimension::ErrorKind => sample
            .error_kind
            .clone()
            .unwrap_or_else(|| "none".to_string()),
    }
}

fn grouped_counts(
    inner: &StatsInner,
    window: TimeWindow,
    dimension: StatsDimension,
    filter: Option<&StatsFilter>,
) -> BTreeMap<String, f64> {
    if window == TimeWindow::SinceStart && filter.is_none() {
        let map: Box<dyn Iterator<Item = (String, f64)>> = match dimension {
            StatsDimension::Endpoint => Box::new(
                inner
                    .cumulative
                    .by_endpoint
                    .iter()
                    .map(|(k, v)| (k.clone(), *v as f64)),
            ),
            StatsDimension::Method => Box::new(
                inner
                    .cumulative
                    .by_method
                    .iter()
                    .map(|(k, v)| (k.clone(), *v as f64)),
            ),
            StatsDimension::Status => Box::new(
                inner
                    .cumulative
                    .by_status
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v as f64)),
            ),
            StatsDimension::ErrorKind => Box::new(
                inner
                    .cumulative
                    .by_error_kind
                    .iter()
                    .map(|(k, v)| (k.clone(), *v as f64)),
            ),
        };
        return map.collect();
    }

    let mut groups: BTreeMap<String, f64> = BTreeMap::new();
    for sample in inner.window_samples(filter) {
        *groups.entry(dimension_value(sample, dimension)).or_insert(0.0) += 1.0;
    }
    groups
}

fn percentile_report(
    inner: &StatsInner,
    filter: Option<&StatsFilter>,
    percentile: f64,
) -> StatsReport {
    let mut durations: Vec<u64> = inner
        .window_samples(filter)
        .iter()
        .map(|s| s.duration_ms)
        .collect();
    durations.sort_unstable();
    let value = if durations.is_empty() {
        0.0
    } else {
        let rank = ((percentile / 100.0) * durations.len() as f64).ceil() as usize;
        durations[rank.clamp(1, durations.len()) - 1] as f64
    };
    StatsReport {
        value: Some(value),
        groups: BTreeMap::new(),
    }
}
