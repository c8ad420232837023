// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Counters, per-service call/error tallies, and latency percentiles,
//! exposed as an immutable snapshot.
//!
//! Counters are `prometheus` primitives; the percentile reservoir is
//! hand-rolled since `prometheus` summaries don't give us freely-queryable
//! quantiles without a push-based collector.

use crate::workflow::ServiceId;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

const RESERVOIR_CAPACITY: usize = 512;

/// Fixed-capacity reservoir sampler: keeps the most recent N samples and
/// reports percentiles over them. Good enough for dashboards, not a
/// statistically rigorous reservoir (no random eviction).
#[derive(Debug, Default)]
struct Reservoir {
    samples: Vec<f64>,
}

impl Reservoir {
    fn push(&mut self, value: f64) {
        if self.samples.len() >= RESERVOIR_CAPACITY {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// An immutable point-in-time view of all engine metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub workflows_timed_out: u64,
    pub cumulative_execution_ms: u64,
    pub workflow_latency_p50_ms: f64,
    pub workflow_latency_p95_ms: f64,
    pub workflow_latency_p99_ms: f64,
    pub service_call_count: HashMap<String, u64>,
    pub service_error_count: HashMap<String, u64>,
    pub service_latency_p50_ms: HashMap<String, f64>,
    pub service_latency_p95_ms: HashMap<String, f64>,
    pub service_latency_p99_ms: HashMap<String, f64>,
    pub events_published: u64,
    pub events_dropped: u64,
    pub events_average_handler_latency_ms: f64,
    pub transactions_active: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_average_duration_ms: f64,
}

/// Central metrics aggregator. Counters use atomic `prometheus` types;
/// the latency reservoir and per-service histograms use a `parking_lot`
/// mutex, matching the concurrency idiom used elsewhere in this crate.
pub struct MetricsAggregator {
    registry: Registry,
    workflows_started: IntCounter,
    workflows_completed: IntCounter,
    workflows_failed: IntCounter,
    workflows_cancelled: IntCounter,
    workflows_timed_out: IntCounter,
    cumulative_execution_ms: IntCounter,
    service_call_count: IntCounterVec,
    service_error_count: IntCounterVec,
    events_published: IntCounter,
    events_dropped: IntCounter,
    transactions_committed: IntCounter,
    transactions_aborted: IntCounter,
    workflow_latency: Mutex<Reservoir>,
    service_latency: Mutex<HashMap<ServiceId, Reservoir>>,
    active_transactions: Mutex<std::collections::HashSet<Uuid>>,
    transaction_started_at: Mutex<HashMap<Uuid, Instant>>,
    transaction_duration_sum_ms: AtomicU64,
    transaction_duration_count: AtomicU64,
    handler_latency_sum_ms: AtomicU64,
    handler_latency_count: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        let registry = Registry::new();

        let workflows_started =
            IntCounter::with_opts(Opts::new("workflows_started_total", "workflows started")).unwrap();
        let workflows_completed =
            IntCounter::with_opts(Opts::new("workflows_completed_total", "workflows completed")).unwrap();
        let workflows_failed =
            IntCounter::with_opts(Opts::new("workflows_failed_total", "workflows failed")).unwrap();
        let workflows_cancelled =
            IntCounter::with_opts(Opts::new("workflows_cancelled_total", "workflows cancelled")).unwrap();
        let workflows_timed_out =
            IntCounter::with_opts(Opts::new("workflows_timed_out_total", "workflows timed out")).unwrap();
        let cumulative_execution_ms = IntCounter::with_opts(Opts::new(
            "workflow_execution_ms_total",
            "cumulative workflow execution time in milliseconds",
        ))
        .unwrap();
        let service_call_count = IntCounterVec::new(
            Opts::new("service_call_count", "calls per service"),
            &["service"],
        )
        .unwrap();
        let service_error_count = IntCounterVec::new(
            Opts::new("service_error_count", "errors per service"),
            &["service"],
        )
        .unwrap();
        let events_published =
            IntCounter::with_opts(Opts::new("events_published_total", "events published")).unwrap();
        let events_dropped =
            IntCounter::with_opts(Opts::new("events_dropped_total", "events dropped for full subscriber queues")).unwrap();
        let transactions_committed =
            IntCounter::with_opts(Opts::new("transactions_committed_total", "transactions committed")).unwrap();
        let transactions_aborted =
            IntCounter::with_opts(Opts::new("transactions_aborted_total", "transactions aborted")).unwrap();

        for c in [
            &workflows_started,
            &workflows_completed,
            &workflows_failed,
            &workflows_cancelled,
            &workflows_timed_out,
            &cumulative_execution_ms,
            &events_published,
            &events_dropped,
            &transactions_committed,
            &transactions_aborted,
        ] {
            registry.register(Box::new(c.clone())).ok();
        }
        registry.register(Box::new(service_call_count.clone())).ok();
        registry.register(Box::new(service_error_count.clone())).ok();

        Self {
            registry,
            workflows_started,
            workflows_completed,
            workflows_failed,
            workflows_cancelled,
            workflows_timed_out,
            cumulative_execution_ms,
            service_call_count,
            service_error_count,
            events_published,
            events_dropped,
            transactions_committed,
            transactions_aborted,
            workflow_latency: Mutex::new(Reservoir::default()),
            service_latency: Mutex::new(HashMap::new()),
            active_transactions: Mutex::new(std::collections::HashSet::new()),
            transaction_started_at: Mutex::new(HashMap::new()),
            transaction_duration_sum_ms: AtomicU64::new(0),
            transaction_duration_count: AtomicU64::new(0),
            handler_latency_sum_ms: AtomicU64::new(0),
            handler_latency_count: AtomicU64::new(0),
        }
    }

    pub fn record_workflow_started(&self) {
        self.workflows_started.inc();
    }

    pub fn record_workflow_completed(&self, duration: Duration) {
        self.workflows_completed.inc();
        self.record_duration(duration);
    }

    pub fn record_workflow_failed(&self, duration: Duration) {
        self.workflows_failed.inc();
        self.record_duration(duration);
    }

    pub fn record_workflow_cancelled(&self, duration: Duration) {
        self.workflows_cancelled.inc();
        self.record_duration(duration);
    }

    pub fn record_workflow_timed_out(&self, duration: Duration) {
        self.workflows_timed_out.inc();
        self.record_duration(duration);
    }

    fn record_duration(&self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        self.cumulative_execution_ms.inc_by(millis);
        self.workflow_latency.lock().push(millis as f64);
    }

    pub fn record_service_call(&self, service_id: ServiceId) {
        self.service_call_count
            .with_label_values(&[service_id.as_str()])
            .inc();
    }

    pub fn record_service_error(&self, service_id: ServiceId) {
        self.service_error_count
            .with_label_values(&[service_id.as_str()])
            .inc();
    }

    /// Feeds a successful call's wall-clock duration into that service's
    /// latency reservoir, for the per-service histogram spec.md §4.8 calls
    /// for.
    pub fn record_service_latency(&self, service_id: ServiceId, duration: Duration) {
        self.service_latency
            .lock()
            .entry(service_id)
            .or_default()
            .push(duration.as_millis() as f64);
    }

    pub fn record_event_published(&self) {
        self.events_published.inc();
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.inc();
    }

    /// Feeds one handler invocation's wall-clock duration into the running
    /// average exposed as `events_average_handler_latency_ms`.
    pub fn record_handler_latency(&self, duration: Duration) {
        self.handler_latency_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.handler_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_started(&self, transaction_id: Uuid) {
        self.active_transactions.lock().insert(transaction_id);
        self.transaction_started_at
            .lock()
            .insert(transaction_id, Instant::now());
    }

    pub fn record_transaction_committed(&self, transaction_id: Uuid) {
        self.transactions_committed.inc();
        self.active_transactions.lock().remove(&transaction_id);
        self.record_transaction_duration(transaction_id);
    }

    pub fn record_transaction_aborted(&self, transaction_id: Uuid) {
        self.transactions_aborted.inc();
        self.active_transactions.lock().remove(&transaction_id);
        self.record_transaction_duration(transaction_id);
    }

    fn record_transaction_duration(&self, transaction_id: Uuid) {
        if let Some(started_at) = self.transaction_started_at.lock().remove(&transaction_id) {
            let millis = started_at.elapsed().as_millis() as u64;
            self.transaction_duration_sum_ms.fetch_add(millis, Ordering::Relaxed);
            self.transaction_duration_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The underlying `prometheus::Registry`, for hosts that want to expose
    /// a `/metrics` scrape endpoint alongside `snapshot()`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let reservoir = self.workflow_latency.lock();
        let service_call_count = Self::label_map(&self.service_call_count);
        let service_error_count = Self::label_map(&self.service_error_count);
        let (service_latency_p50_ms, service_latency_p95_ms, service_latency_p99_ms) =
            self.service_latency_percentiles();

        MetricsSnapshot {
            workflows_started: self.workflows_started.get(),
            workflows_completed: self.workflows_completed.get(),
            workflows_failed: self.workflows_failed.get(),
            workflows_cancelled: self.workflows_cancelled.get(),
            workflows_timed_out: self.workflows_timed_out.get(),
            cumulative_execution_ms: self.cumulative_execution_ms.get(),
            workflow_latency_p50_ms: reservoir.percentile(0.50),
            workflow_latency_p95_ms: reservoir.percentile(0.95),
            workflow_latency_p99_ms: reservoir.percentile(0.99),
            service_call_count,
            service_error_count,
            service_latency_p50_ms,
            service_latency_p95_ms,
            service_latency_p99_ms,
            events_published: self.events_published.get(),
            events_dropped: self.events_dropped.get(),
            events_average_handler_latency_ms: Self::average(
                self.handler_latency_sum_ms.load(Ordering::Relaxed),
                self.handler_latency_count.load(Ordering::Relaxed),
            ),
            transactions_active: self.active_transactions.lock().len() as u64,
            transactions_committed: self.transactions_committed.get(),
            transactions_aborted: self.transactions_aborted.get(),
            transactions_average_duration_ms: Self::average(
                self.transaction_duration_sum_ms.load(Ordering::Relaxed),
                self.transaction_duration_count.load(Ordering::Relaxed),
            ),
        }
    }

    fn average(sum: u64, count: u64) -> f64 {
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    fn service_latency_percentiles(&self) -> (HashMap<String, f64>, HashMap<String, f64>, HashMap<String, f64>) {
        let reservoirs = self.service_latency.lock();
        let mut p50 = HashMap::new();
        let mut p95 = HashMap::new();
        let mut p99 = HashMap::new();
        for (service_id, reservoir) in reservoirs.iter() {
            let name = service_id.as_str().to_string();
            p50.insert(name.clone(), reservoir.percentile(0.50));
            p95.insert(name.clone(), reservoir.percentile(0.95));
            p99.insert(name, reservoir.percentile(0.99));
        }
        (p50, p95, p99)
    }

    fn label_map(vec: &IntCounterVec) -> HashMap<String, u64> {
        ServiceId::all()
            .into_iter()
            .map(|service_id| {
                let value = vec.with_label_values(&[service_id.as_str()]).get();
                (service_id.as_str().to_string(), value)
            })
            .filter(|(_, value)| *value > 0)
            .collect()
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_aggregator_snapshots_all_zero() {
        let metrics = MetricsAggregator::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.workflows_started, 0);
        assert_eq!(snap.workflows_completed, 0);
        assert!(snap.service_call_count.is_empty());
    }

    #[test]
    fn snapshot_called_twice_with_no_activity_is_equal() {
        let metrics = MetricsAggregator::new();
        let a = metrics.snapshot();
        let b = metrics.snapshot();
        assert_eq!(a.workflows_started, b.workflows_started);
        assert_eq!(a.workflow_latency_p50_ms, b.workflow_latency_p50_ms);
    }

    #[test]
    fn service_calls_and_errors_are_tallied_per_service() {
        let metrics = MetricsAggregator::new();
        metrics.record_service_call(ServiceId::Nlu);
        metrics.record_service_call(ServiceId::Nlu);
        metrics.record_service_error(ServiceId::Nlu);

        let snap = metrics.snapshot();
        assert_eq!(snap.service_call_count["nlu"], 2);
        assert_eq!(snap.service_error_count["nlu"], 1);
    }

    #[test]
    fn workflow_completion_feeds_the_latency_reservoir() {
        let metrics = MetricsAggregator::new();
        metrics.record_workflow_completed(Duration::from_millis(100));
        metrics.record_workflow_completed(Duration::from_millis(200));
        metrics.record_workflow_completed(Duration::from_millis(300));

        let snap = metrics.snapshot();
        assert_eq!(snap.workflows_completed, 3);
        assert_eq!(snap.cumulative_execution_ms, 600);
        assert!(snap.workflow_latency_p50_ms > 0.0);
    }

    #[test]
    fn transaction_lifecycle_updates_active_and_terminal_counts() {
        let metrics = MetricsAggregator::new();
        let id = uuid::Uuid::new_v4();
        metrics.record_transaction_started(id);
        assert_eq!(metrics.snapshot().transactions_active, 1);

        metrics.record_transaction_committed(id);
        let snap = metrics.snapshot();
        assert_eq!(snap.transactions_active, 0);
        assert_eq!(snap.transactions_committed, 1);
    }

    #[test]
    fn transaction_duration_is_averaged_across_terminal_transactions() {
        let metrics = MetricsAggregator::new();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        metrics.record_transaction_started(a);
        metrics.record_transaction_started(b);
        metrics.record_transaction_committed(a);
        metrics.record_transaction_aborted(b);

        let snap = metrics.snapshot();
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert!(snap.transactions_average_duration_ms >= 0.0);
    }

    #[test]
    fn service_latency_is_tracked_per_service_and_exposed_as_percentiles() {
        let metrics = MetricsAggregator::new();
        metrics.record_service_latency(ServiceId::Nlu, Duration::from_millis(50));
        metrics.record_service_latency(ServiceId::Nlu, Duration::from_millis(150));
        metrics.record_service_latency(ServiceId::StyleProfile, Duration::from_millis(10));

        let snap = metrics.snapshot();
        assert!(snap.service_latency_p50_ms["nlu"] > 0.0);
        assert!(snap.service_latency_p99_ms["nlu"] >= snap.service_latency_p50_ms["nlu"]);
        assert!(snap.service_latency_p50_ms.contains_key("style-profile"));
        assert!(!snap.service_latency_p50_ms.contains_key("image-processing"));
    }

    #[test]
    fn handler_latency_is_averaged_across_invocations() {
        let metrics = MetricsAggregator::new();
        metrics.record_handler_latency(Duration::from_millis(10));
        metrics.record_handler_latency(Duration::from_millis(30));

        let snap = metrics.snapshot();
        assert_eq!(snap.events_average_handler_latency_ms, 20.0);
    }
}
