// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Two-phase commit coordination across workflow participants, correlated
//! over the in-process event bus.
//!
//! Participant responses are matched back to a transaction purely by
//! `correlation_id == transaction_id`; the bus is the chosen correlation
//! transport, which keeps this coordinator's wire shape identical to every
//! other event exchanged by this engine instead of inventing a second
//! request/response channel.

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventType, ServiceEvent};
use crate::metrics::MetricsAggregator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Phase a transaction currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

/// The durable record of one two-phase-commit transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContext {
    pub transaction_id: Uuid,
    pub coordinator: String,
    pub participants: Vec<String>,
    pub status: TransactionStatus,
    pub operations: HashMap<String, Value>,
    pub compensations: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Drives prepare/commit/abort over `EventBus`, with a background sweeper
/// that aborts transactions that overrun their deadline.
pub struct TransactionCoordinator {
    bus: EventBus,
    metrics: Arc<MetricsAggregator>,
    transactions: DashMap<Uuid, Mutex<TransactionContext>>,
    prepare_timeout: Duration,
    commit_timeout: Duration,
}

impl TransactionCoordinator {
    pub fn new(
        bus: EventBus,
        metrics: Arc<MetricsAggregator>,
        prepare_timeout: Duration,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            metrics,
            transactions: DashMap::new(),
            prepare_timeout,
            commit_timeout,
        }
    }

    /// Registers a new transaction in `Pending` state and returns its id.
    pub fn begin(
        &self,
        coordinator: impl Into<String>,
        participants: Vec<String>,
        operations: HashMap<String, Value>,
        default_timeout: Duration,
    ) -> Uuid {
        let transaction_id = Uuid::new_v4();
        let now = Utc::now();
        let ctx = TransactionContext {
            transaction_id,
            coordinator: coordinator.into(),
            participants,
            status: TransactionStatus::Pending,
            operations,
            compensations: HashMap::new(),
            started_at: now,
            deadline: now + chrono::Duration::from_std(default_timeout).unwrap_or_default(),
        };
        self.transactions.insert(transaction_id, Mutex::new(ctx));
        self.metrics.record_transaction_started(transaction_id);
        transaction_id
    }

    pub fn status(&self, transaction_id: Uuid) -> Result<TransactionStatus> {
        self.get(transaction_id).map(|ctx| ctx.lock().status)
    }

    fn get(&self, transaction_id: Uuid) -> Result<dashmap::mapref::one::Ref<'_, Uuid, Mutex<TransactionContext>>> {
        self.transactions
            .get(&transaction_id)
            .ok_or_else(|| OrchestratorError::Other(format!("unknown transaction: {transaction_id}")))
    }

    /// Sends `prepare` requests to every participant and waits for their
    /// votes. All participants must vote `"prepared"` within
    /// `prepare_timeout` or the transaction moves straight to `Aborted`.
    pub async fn prepare(&self, transaction_id: Uuid) -> Result<()> {
        let (participants, operations) = {
            let entry = self.get(transaction_id)?;
            let mut ctx = entry.lock();
            ctx.status = TransactionStatus::Preparing;
            (ctx.participants.clone(), ctx.operations.clone())
        };

        let subscriber = self.bus.subscribe();
        for participant in &participants {
            let payload = serde_json::json!({
                "phase": "prepare",
                "operation": operations.get(participant).cloned().unwrap_or(Value::Null),
            });
            self.bus.publish(
                ServiceEvent::new(EventType::ServiceRequest, "orchestrator", payload)
                    .with_correlation(transaction_id)
                    .with_target(participant.clone()),
            );
        }

        let votes = self
            .collect_responses(&subscriber, transaction_id, &participants, self.prepare_timeout)
            .await;

        let all_prepared = participants
            .iter()
            .all(|p| votes.get(p).map(|v| v["vote"] == "prepared").unwrap_or(false));

        let entry = self.get(transaction_id)?;
        let mut ctx = entry.lock();
        if all_prepared {
            ctx.status = TransactionStatus::Prepared;
            info!(%transaction_id, "all participants prepared");
            Ok(())
        } else {
            ctx.status = TransactionStatus::Aborted;
            self.metrics.record_transaction_aborted(transaction_id);
            warn!(%transaction_id, "prepare phase failed, aborting");
            drop(ctx);
            self.broadcast_abort(transaction_id, &participants);
            Err(OrchestratorError::Other(format!(
                "transaction {transaction_id} failed to prepare"
            )))
        }
    }

    /// Sends `commit` requests to every participant. If any participant
    /// fails to acknowledge within `commit_timeout`, the transaction is left
    /// in a flagged, un-recovered state — some participants may have
    /// already committed — rather than silently retried.
    pub async fn commit(&self, transaction_id: Uuid) -> Result<()> {
        let participants = {
            let entry = self.get(transaction_id)?;
            let mut ctx = entry.lock();
            if ctx.status != TransactionStatus::Prepared {
                return Err(OrchestratorError::Other(format!(
                    "transaction {transaction_id} is not in Prepared state"
                )));
            }
            ctx.status = TransactionStatus::Committing;
            ctx.participants.clone()
        };

        let subscriber = self.bus.subscribe();
        for participant in &participants {
            self.bus.publish(
                ServiceEvent::new(EventType::ServiceRequest, "orchestrator", serde_json::json!({"phase": "commit"}))
                    .with_correlation(transaction_id)
                    .with_target(participant.clone()),
            );
        }

        let acks = self
            .collect_responses(&subscriber, transaction_id, &participants, self.commit_timeout)
            .await;

        let all_committed = participants
            .iter()
            .all(|p| acks.get(p).map(|v| v["vote"] == "committed").unwrap_or(false));

        let entry = self.get(transaction_id)?;
        let mut ctx = entry.lock();
        if all_committed {
            ctx.status = TransactionStatus::Committed;
            self.metrics.record_transaction_committed(transaction_id);
            info!(%transaction_id, "transaction committed");
            Ok(())
        } else {
            let missing: Vec<&String> = participants
                .iter()
                .filter(|p| acks.get(*p).map(|v| v["vote"] != "committed").unwrap_or(true))
                .collect();
            warn!(%transaction_id, ?missing, "post-prepare inconsistency: not all participants committed");
            Err(OrchestratorError::PostPrepareInconsistency {
                transaction_id,
                detail: format!("participants not confirmed committed: {missing:?}"),
            })
        }
    }

    /// Best-effort abort notification; always terminates the transaction as
    /// `Aborted` regardless of participant acknowledgement, since an abort
    /// that a participant fails to hear is a participant-side recovery
    /// concern, not this coordinator's.
    pub async fn abort(&self, transaction_id: Uuid) -> Result<()> {
        let participants = {
            let entry = self.get(transaction_id)?;
            let mut ctx = entry.lock();
            ctx.status = TransactionStatus::Aborting;
            ctx.participants.clone()
        };
        self.broadcast_abort(transaction_id, &participants);

        let entry = self.get(transaction_id)?;
        entry.lock().status = TransactionStatus::Aborted;
        self.metrics.record_transaction_aborted(transaction_id);
        Ok(())
    }

    fn broadcast_abort(&self, transaction_id: Uuid, participants: &[String]) {
        for participant in participants {
            self.bus.publish(
                ServiceEvent::new(EventType::ServiceRequest, "orchestrator", serde_json::json!({"phase": "abort"}))
                    .with_correlation(transaction_id)
                    .with_target(participant.clone()),
            );
        }
    }

    async fn collect_responses(
        &self,
        subscriber: &crate::events::Subscriber,
        transaction_id: Uuid,
        participants: &[String],
        timeout: Duration,
    ) -> HashMap<String, Value> {
        let mut responses = HashMap::new();
        let mut outstanding: HashSet<String> = participants.iter().cloned().collect();

        let _ = tokio::time::timeout(timeout, async {
            while !outstanding.is_empty() {
                match subscriber.recv().await {
                    Some(event) if event.correlation_id == Some(transaction_id) && event.event_type == EventType::ServiceResponse => {
                        if outstanding.remove(&event.source_service) {
                            responses.insert(event.source_service.clone(), event.payload);
                        }
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        })
        .await;

        responses
    }

    /// Scans all non-terminal transactions and aborts any past its
    /// deadline. Intended to run on a periodic background task.
    pub async fn sweep_timeouts(&self) {
        let overdue: Vec<Uuid> = self
            .transactions
            .iter()
            .filter_map(|entry| {
                let ctx = entry.value().lock();
                if !ctx.status.is_terminal() && Utc::now() > ctx.deadline {
                    Some(ctx.transaction_id)
                } else {
                    None
                }
            })
            .collect();

        for transaction_id in overdue {
            warn!(%transaction_id, "transaction exceeded its deadline, aborting");
            let _ = self.abort(transaction_id).await;
        }
    }
}
