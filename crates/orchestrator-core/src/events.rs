// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! In-process publish/subscribe bus used for lifecycle notifications and
//! transaction-phase correlation.
//!
//! `tokio::sync::broadcast` (used elsewhere in the wider corpus this crate
//! draws from) delivers every message to every subscriber and has no notion
//! of per-subscriber backpressure — a slow subscriber either stalls
//! publishers or silently loses the oldest entries for the *whole* bus, not
//! just itself. Transaction correlation needs isolation between
//! subscribers, so this bus hand-rolls bounded, per-subscriber ring buffers
//! over the `dashmap` + `parking_lot` concurrency idiom used throughout this
//! crate, with a `tokio::sync::Notify` for wakeup.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, trace};
use uuid::Uuid;

/// The closed set of event kinds this engine publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServiceRequest,
    ServiceResponse,
    ServiceError,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    DataUpdated,
    SystemHealthCheck,
}

/// One message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub source_service: String,
    pub target_service: Option<String>,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

impl ServiceEvent {
    pub fn new(event_type: EventType, source_service: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            source_service: source_service.into(),
            target_service: None,
            payload,
            correlation_id: None,
            created_at: Utc::now(),
            ttl: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_target(mut self, target_service: impl Into<String>) -> Self {
        self.target_service = Some(target_service.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.ttl
            .map(|ttl| Utc::now().signed_duration_since(self.created_at).to_std().unwrap_or_default() > ttl)
            .unwrap_or(false)
    }
}

struct Subscription {
    service_name: String,
    filter: HashSet<EventType>,
    queue: Mutex<VecDeque<ServiceEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Subscription {
    /// A subscriber matches an event when its filter admits the event's type
    /// (an empty filter admits every type) and the event is either a
    /// broadcast (`target_service` unset) or targeted at this subscriber's
    /// `service_name`.
    fn matches(&self, event: &ServiceEvent) -> bool {
        let type_matches = self.filter.is_empty() || self.filter.contains(&event.event_type);
        let target_matches = match &event.target_service {
            Some(target) => target == &self.service_name,
            None => true,
        };
        type_matches && target_matches
    }
}

/// A handle returned to a subscriber, used to pull queued events.
pub struct Subscriber {
    id: Uuid,
    bus: Arc<EventBusInner>,
}

impl Subscriber {
    /// Awaits and returns the next event for this subscriber, or `None` if
    /// the bus was closed while waiting.
    pub async fn recv(&self) -> Option<ServiceEvent> {
        loop {
            let subscription = self.bus.subscriptions.get(&self.id)?;
            if let Some(event) = subscription.queue.lock().pop_front() {
                return Some(event);
            }
            subscription.notify.notified().await;
        }
    }

    /// Non-blocking drain of whatever is currently queued.
    pub fn try_recv_all(&self) -> Vec<ServiceEvent> {
        match self.bus.subscriptions.get(&self.id) {
            Some(subscription) => subscription.queue.lock().drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Count of events dropped for this subscriber due to a full queue.
    pub fn dropped_count(&self) -> u64 {
        self.bus
            .subscriptions
            .get(&self.id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.bus.subscriptions.remove(&self.id);
    }
}

struct EventBusInner {
    subscriptions: DashMap<Uuid, Subscription>,
    handlers: DashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

/// A registered reaction to every event of one `EventType`, dispatched after
/// subscriber fan-out. Distinct from a `Subscriber`: a handler runs inline in
/// the bus's own dispatch task rather than being pulled by the registrant,
/// and its failure is contained rather than surfaced.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ServiceEvent) -> crate::error::Result<()>;
}

/// Publish/subscribe bus with bounded, drop-oldest, per-subscriber queues.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
    default_capacity: usize,
    on_publish: Arc<dyn Fn() + Send + Sync>,
    on_drop: Arc<dyn Fn() + Send + Sync>,
    on_handler_latency: Arc<dyn Fn(Duration) + Send + Sync>,
    sink: Arc<dyn DurableEventSink>,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self::with_sink(default_capacity, Arc::new(InMemoryEventSink::new(default_capacity)))
    }

    /// Builds a bus backed by a caller-supplied durable sink instead of the
    /// default in-memory ring, for hosts that want an external event store.
    pub fn with_sink(default_capacity: usize, sink: Arc<dyn DurableEventSink>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscriptions: DashMap::new(),
                handlers: DashMap::new(),
            }),
            default_capacity,
            on_publish: Arc::new(|| {}),
            on_drop: Arc::new(|| {}),
            on_handler_latency: Arc::new(|_| {}),
            sink,
        }
    }

    /// Attaches callbacks (typically metrics recorders) invoked on every
    /// publish and every drop, respectively.
    pub fn with_hooks(
        mut self,
        on_publish: impl Fn() + Send + Sync + 'static,
        on_drop: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.on_publish = Arc::new(on_publish);
        self.on_drop = Arc::new(on_drop);
        self
    }

    /// Attaches a callback invoked with each handler's wall-clock duration,
    /// typically a metrics recorder feeding the average handler latency
    /// gauge.
    pub fn with_handler_metrics(mut self, on_handler_latency: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_handler_latency = Arc::new(on_handler_latency);
        self
    }

    /// The durable sink events are persisted to on every `publish`.
    pub fn sink(&self) -> &Arc<dyn DurableEventSink> {
        &self.sink
    }

    /// Registers `handler` to run against every future event of `event_type`,
    /// after subscriber fan-out. A handler's error is logged and does not
    /// affect other handlers or the publisher.
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.inner.handlers.entry(event_type).or_default().push(handler);
    }

    /// Registers an unnamed, unfiltered subscriber: it receives every
    /// broadcast event (no `target_service`) regardless of type. Suited to
    /// tests and audit taps; a service that needs targeted delivery should
    /// use [`EventBus::subscribe_as`].
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_as("", Vec::<EventType>::new())
    }

    /// Registers a subscriber under `service_name`, receiving only events
    /// whose type is in `filter` (an empty filter admits every type) and
    /// that are either broadcast or targeted at `service_name`.
    pub fn subscribe_as(
        &self,
        service_name: impl Into<String>,
        filter: impl IntoIterator<Item = EventType>,
    ) -> Subscriber {
        self.subscribe_as_with_capacity(service_name, filter, self.default_capacity)
    }

    pub fn subscribe_as_with_capacity(
        &self,
        service_name: impl Into<String>,
        filter: impl IntoIterator<Item = EventType>,
        capacity: usize,
    ) -> Subscriber {
        let id = Uuid::new_v4();
        self.inner.subscriptions.insert(
            id,
            Subscription {
                service_name: service_name.into(),
                filter: filter.into_iter().collect(),
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
            },
        );
        Subscriber {
            id,
            bus: self.inner.clone(),
        }
    }

    /// Publishes an event: persists it to the durable sink, fans it out to
    /// every subscriber whose filter and target match, then dispatches it to
    /// any handlers registered for its type. A subscriber whose queue is
    /// full has its oldest entry dropped to make room — the newest event
    /// always wins. Sink persistence and handler dispatch both run on
    /// spawned tasks so neither a slow sink nor a slow handler ever blocks
    /// the publisher.
    pub fn publish(&self, event: ServiceEvent) {
        (self.on_publish)();
        trace!(event_type = ?event.event_type, event_id = %event.event_id, "publishing event");

        let sink = self.sink.clone();
        let durable_copy = event.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.store(&durable_copy).await {
                tracing::warn!(error = %err, "failed to persist event to durable sink");
            }
        });

        for entry in self.inner.subscriptions.iter() {
            let subscription = entry.value();
            if !subscription.matches(&event) {
                continue;
            }
            let mut queue = subscription.queue.lock();
            if queue.len() >= subscription.capacity {
                queue.pop_front();
                subscription.dropped.fetch_add(1, Ordering::Relaxed);
                (self.on_drop)();
            }
            queue.push_back(event.clone());
            drop(queue);
            subscription.notify.notify_one();
        }

        if let Some(handlers) = self.inner.handlers.get(&event.event_type).map(|h| h.clone()) {
            let on_handler_latency = self.on_handler_latency.clone();
            let handler_event = event;
            tokio::spawn(async move {
                for handler in handlers {
                    let started = Instant::now();
                    if let Err(err) = handler.handle(&handler_event).await {
                        error!(error = %err, event_type = ?handler_event.event_type, "event handler failed");
                    }
                    on_handler_latency(started.elapsed());
                }
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Durable append-only store for events, separate from the live bus. The
/// live bus is fire-and-forget; a sink lets late joiners and audit tooling
/// replay history.
#[async_trait::async_trait]
pub trait DurableEventSink: Send + Sync {
    async fn store(&self, event: &ServiceEvent) -> crate::error::Result<()>;
    async fn query_by_correlation(&self, correlation_id: Uuid) -> crate::error::Result<Vec<ServiceEvent>>;
    async fn health_check(&self) -> crate::error::Result<()>;
}

/// Bounded in-memory ring buffer implementation of `DurableEventSink`,
/// suitable as a default when no external store is configured.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<ServiceEvent>>,
    capacity: usize,
}

impl InMemoryEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }
}

#[async_trait::async_trait]
impl DurableEventSink for InMemoryEventSink {
    async fn store(&self, event: &ServiceEvent) -> crate::error::Result<()> {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }

    async fn query_by_correlation(&self, correlation_id: Uuid) -> crate::error::Result<Vec<ServiceEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.correlation_id == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType) -> ServiceEvent {
        ServiceEvent::new(event_type, "orchestrator", serde_json::json!({}))
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new(10);
        let sub = bus.subscribe();
        bus.publish(event(EventType::WorkflowStarted));
        bus.publish(event(EventType::WorkflowCompleted));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(matches!(first.event_type, EventType::WorkflowStarted));
        assert!(matches!(second.event_type, EventType::WorkflowCompleted));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_counts_it() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        bus.publish(event(EventType::ServiceRequest));
        bus.publish(event(EventType::ServiceResponse));
        bus.publish(event(EventType::ServiceError));

        let drained = sub.try_recv_all();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0].event_type, EventType::ServiceResponse));
        assert!(matches!(drained[1].event_type, EventType::ServiceError));
        assert_eq!(sub.dropped_count(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_receiving_without_affecting_others() {
        let bus = EventBus::new(10);
        let sub_a = bus.subscribe();
        {
            let sub_b = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 2);
            drop(sub_b);
        }
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event(EventType::DataUpdated));
        let received = sub_a.try_recv_all();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn publish_persists_to_the_durable_sink() {
        let sink = Arc::new(InMemoryEventSink::new(16));
        let bus = EventBus::with_sink(10, sink.clone());
        let mut published = event(EventType::WorkflowStarted);
        published.correlation_id = Some(Uuid::new_v4());
        bus.publish(published.clone());

        // Sink persistence is spawned off the publish call; give it a tick.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let stored = sink.query_by_correlation(published.correlation_id.unwrap()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_id, published.event_id);
    }

    #[tokio::test]
    async fn targeted_event_is_delivered_only_to_its_target_subscriber() {
        let bus = EventBus::new(10);
        let inventory = bus.subscribe_as("inventory", [EventType::ServiceRequest]);
        let ledger = bus.subscribe_as("ledger", [EventType::ServiceRequest]);

        bus.publish(
            event(EventType::ServiceRequest).with_target("inventory"),
        );

        assert_eq!(inventory.try_recv_all().len(), 1);
        assert_eq!(ledger.try_recv_all().len(), 0);
    }

    #[tokio::test]
    async fn broadcast_event_reaches_every_subscriber_whose_filter_matches() {
        let bus = EventBus::new(10);
        let a = bus.subscribe_as("a", [EventType::WorkflowCompleted]);
        let b = bus.subscribe_as("b", [EventType::WorkflowCompleted]);
        let narrow = bus.subscribe_as("c", [EventType::ServiceError]);

        bus.publish(event(EventType::WorkflowCompleted));

        assert_eq!(a.try_recv_all().len(), 1);
        assert_eq!(b.try_recv_all().len(), 1);
        assert_eq!(narrow.try_recv_all().len(), 0);
    }

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<Uuid>>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &ServiceEvent) -> crate::error::Result<()> {
            self.seen.lock().push(event.event_id);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &ServiceEvent) -> crate::error::Result<()> {
            Err(crate::error::OrchestratorError::Other("handler boom".to_string()))
        }
    }

    #[tokio::test]
    async fn registered_handlers_run_for_every_matching_event_and_a_failure_does_not_stop_others() {
        let bus = EventBus::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register_handler(EventType::WorkflowCompleted, Arc::new(FailingHandler));
        bus.register_handler(
            EventType::WorkflowCompleted,
            Arc::new(RecordingHandler { seen: seen.clone() }),
        );

        let published = event(EventType::WorkflowCompleted);
        bus.publish(published.clone());

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec![published.event_id]);
    }

    #[tokio::test]
    async fn handler_latency_hook_fires_once_per_handler_invocation() {
        let bus = EventBus::new(10);
        let calls = Arc::new(AtomicU64::new(0));
        let hook_calls = calls.clone();
        let bus = bus.with_handler_metrics(move |_duration| {
            hook_calls.fetch_add(1, Ordering::Relaxed);
        });
        bus.register_handler(
            EventType::DataUpdated,
            Arc::new(RecordingHandler { seen: Arc::new(Mutex::new(Vec::new())) }),
        );

        bus.publish(event(EventType::DataUpdated));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn in_memory_sink_filters_by_correlation_id() {
        let sink = InMemoryEventSink::new(16);
        let correlation_id = Uuid::new_v4();
        let mut matching = event(EventType::ServiceRequest);
        matching.correlation_id = Some(correlation_id);
        sink.store(&matching).await.unwrap();
        sink.store(&event(EventType::ServiceResponse)).await.unwrap();

        let results = sink.query_by_correlation(correlation_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_id, matching.event_id);
    }
}
