//! Step Executor — fires one due step: re-validates the instance, renders,
//! sends, and records the outcome.
//!
//! Execution is serialized per instance (a retry of step N never races step
//! N+1) while different instances execute concurrently. The re-read at the
//! top of `execute` is the authoritative cancellation check: a cancellation
//! recorded before the run starts is always honored.

use std::sync::Arc;
use std::time::Duration;

use cadence_catalog::CampaignCatalog;
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{DedupKey, DeliveryError, EventType};
use cadence_core::{SequencerError, SequencerResult};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use cadence_store::{DueStep, SequenceStore, StepState};

use crate::render::ContentRenderer;
use crate::retry::RetryPolicy;
use crate::transport::DeliveryTransport;

/// What happened to a due step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Sent { completed: bool },
    Skipped,
    RetryScheduled { attempts: u32 },
    Failed,
}

pub struct Executor {
    store: Arc<dyn SequenceStore>,
    catalog: Arc<CampaignCatalog>,
    renderer: Arc<dyn ContentRenderer>,
    transport: Arc<dyn DeliveryTransport>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
    send_timeout: Duration,
    instance_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        catalog: Arc<CampaignCatalog>,
        renderer: Arc<dyn ContentRenderer>,
        transport: Arc<dyn DeliveryTransport>,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            renderer,
            transport,
            retry,
            events,
            send_timeout,
            instance_locks: DashMap::new(),
        }
    }

    /// Execute one due step to an outcome.
    pub async fn execute(&self, due: &DueStep) -> SequencerResult<ExecutionOutcome> {
        let lock = self
            .instance_locks
            .entry(due.instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let instance = self
            .store
            .get(due.instance_id)
            .ok_or(SequencerError::InstanceNotFound(due.instance_id))?;

        // Authoritative cancellation re-check: the instance may have been
        // cancelled or completed after this step was claimed.
        if !instance.is_active() {
            if instance
                .step(due.step_index)
                .is_some_and(|s| s.state == StepState::Pending)
            {
                self.store.skip_step(
                    due.instance_id,
                    due.step_index,
                    "instance no longer active",
                    Utc::now(),
                )?;
            }
            self.emit(&instance, due.step_index, EventType::StepSkipped, None);
            self.instance_locks.remove(&due.instance_id);
            return Ok(ExecutionOutcome::Skipped);
        }

        let step = instance.step(due.step_index).ok_or_else(|| {
            SequencerError::Store(format!(
                "step {} missing on instance {}",
                due.step_index, due.instance_id
            ))
        })?;
        // Already resolved by a concurrent transition; nothing to do.
        if step.state != StepState::Pending {
            return Ok(ExecutionOutcome::Skipped);
        }

        let dedup_key = DedupKey {
            instance_id: due.instance_id,
            step_index: due.step_index,
        };

        // Render before the write-ahead marker: a render failure makes no
        // transport call and must not look like an ambiguous send.
        let message = match self
            .renderer
            .render(&step.content_key, &instance.binding_data)
        {
            Ok(message) => message,
            Err(e) => {
                error!(
                    dedup_key = %dedup_key,
                    content_key = %step.content_key,
                    binding_data = %instance.binding_data,
                    error = %e,
                    "Render failed; step marked Failed"
                );
                metrics::counter!(
                    "sequencer.steps_failed",
                    "campaign" => instance.campaign_kind.as_str(),
                    "cause" => "render"
                )
                .increment(1);
                self.store.record_failed(
                    due.instance_id,
                    due.step_index,
                    &e.to_string(),
                    Utc::now(),
                )?;
                self.emit(
                    &instance,
                    due.step_index,
                    EventType::StepFailed,
                    Some(e.to_string()),
                );
                return Ok(ExecutionOutcome::Failed);
            }
        };

        // Write-ahead marker: from here until an outcome is recorded, a crash
        // leaves an ambiguous send for the reconciliation queue.
        self.store
            .mark_send_attempted(due.instance_id, due.step_index, Utc::now())?;

        let send_result = match tokio::time::timeout(
            self.send_timeout,
            self.transport.send(&instance.subject_id, &message, dedup_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        };

        let now = Utc::now();
        match send_result {
            Ok(delivery_id) => {
                let last_step = instance
                    .steps
                    .last()
                    .is_some_and(|s| s.step_index == due.step_index);
                let completed =
                    self.store
                        .record_sent(due.instance_id, due.step_index, now, last_step)?;

                info!(
                    dedup_key = %dedup_key,
                    subject_id = %instance.subject_id,
                    campaign = %instance.campaign_kind,
                    delivery_id = %delivery_id,
                    completed = completed,
                    "Step sent"
                );
                metrics::counter!(
                    "sequencer.steps_sent",
                    "campaign" => instance.campaign_kind.as_str()
                )
                .increment(1);
                self.emit(&instance, due.step_index, EventType::StepSent, Some(delivery_id));
                if completed {
                    self.emit(&instance, due.step_index, EventType::InstanceCompleted, None);
                    self.instance_locks.remove(&due.instance_id);
                }
                Ok(ExecutionOutcome::Sent { completed })
            }
            Err(DeliveryError::Transient(reason)) => {
                let failed_attempt = instance
                    .step(due.step_index)
                    .map(|s| s.attempts)
                    .unwrap_or(0)
                    + 1;
                if self.retry.should_retry(failed_attempt) {
                    let next_attempt_at = self.retry.next_attempt_at(now, failed_attempt);
                    let attempts = self.store.record_retry(
                        due.instance_id,
                        due.step_index,
                        &reason,
                        next_attempt_at,
                        now,
                    )?;
                    warn!(
                        dedup_key = %dedup_key,
                        attempts = attempts,
                        next_attempt_at = %next_attempt_at,
                        error = %reason,
                        "Transient delivery failure; retry scheduled"
                    );
                    metrics::counter!(
                        "sequencer.steps_retried",
                        "campaign" => instance.campaign_kind.as_str()
                    )
                    .increment(1);
                    self.emit(
                        &instance,
                        due.step_index,
                        EventType::StepRetryScheduled,
                        Some(reason),
                    );
                    Ok(ExecutionOutcome::RetryScheduled { attempts })
                } else {
                    error!(
                        dedup_key = %dedup_key,
                        attempts = failed_attempt,
                        error = %reason,
                        "Retries exhausted; step marked Failed, instance stays Active"
                    );
                    metrics::counter!(
                        "sequencer.steps_failed",
                        "campaign" => instance.campaign_kind.as_str(),
                        "cause" => "retries_exhausted"
                    )
                    .increment(1);
                    self.store
                        .record_failed(due.instance_id, due.step_index, &reason, now)?;
                    self.emit(&instance, due.step_index, EventType::StepFailed, Some(reason));
                    Ok(ExecutionOutcome::Failed)
                }
            }
            Err(DeliveryError::Permanent(reason)) => {
                error!(
                    dedup_key = %dedup_key,
                    subject_id = %instance.subject_id,
                    error = %reason,
                    "Permanent delivery failure; step marked Failed"
                );
                metrics::counter!(
                    "sequencer.steps_failed",
                    "campaign" => instance.campaign_kind.as_str(),
                    "cause" => "permanent"
                )
                .increment(1);
                self.store
                    .record_failed(due.instance_id, due.step_index, &reason, now)?;
                self.emit(
                    &instance,
                    due.step_index,
                    EventType::StepFailed,
                    Some(reason.clone()),
                );

                // Hard bounce policy: stop the whole sequence rather than
                // keep bouncing on a dead address.
                let cancel_on_hard_bounce = self
                    .catalog
                    .get(instance.campaign_kind)
                    .map(|d| d.cancel_on_hard_bounce)
                    .unwrap_or(true);
                if cancel_on_hard_bounce {
                    if self
                        .store
                        .cancel_instance(due.instance_id, "hard_bounce", now)?
                        .is_some()
                    {
                        self.emit(
                            &instance,
                            due.step_index,
                            EventType::InstanceCancelled,
                            Some("hard_bounce".to_string()),
                        );
                        self.instance_locks.remove(&due.instance_id);
                    }
                }
                Ok(ExecutionOutcome::Failed)
            }
        }
    }

    fn emit(
        &self,
        instance: &cadence_store::SequenceInstance,
        step_index: u32,
        event_type: EventType,
        detail: Option<String>,
    ) {
        self.events.emit(make_event(
            event_type,
            instance.instance_id,
            instance.subject_id.clone(),
            instance.campaign_kind,
            Some(step_index),
            detail,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::TriggerIngestor;
    use crate::render::TemplateRenderer;
    use crate::transport::CaptureTransport;
    use cadence_core::types::CampaignKind;
    use cadence_store::{InstanceStatus, MemoryStore};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        store: Arc<MemoryStore>,
        transport: Arc<CaptureTransport>,
        ingestor: TriggerIngestor,
        executor: Executor,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(CampaignCatalog::builtin());
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CaptureTransport::new());
        let sink = cadence_core::event_bus::noop_sink();
        let ingestor = TriggerIngestor::new(catalog.clone(), store.clone(), sink.clone());
        let executor = Executor::new(
            store.clone(),
            catalog,
            Arc::new(TemplateRenderer::builtin()),
            transport.clone(),
            RetryPolicy::default(),
            sink,
            Duration::from_secs(5),
        );
        Fixture {
            store,
            transport,
            ingestor,
            executor,
        }
    }

    fn first_due(store: &MemoryStore) -> DueStep {
        store
            .due_steps(Utc::now() + ChronoDuration::days(365), 10)
            .into_iter()
            .next()
            .expect("a due step")
    }

    #[tokio::test]
    async fn sends_and_records_step() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                "a@x.com",
                CampaignKind::CartRecovery,
                serde_json::json!({"cart_total": "£22.50", "discount_code": "SAVE10"}),
            )
            .unwrap();

        let due = first_due(&f.store);
        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Sent { completed: false });

        let instance = f.store.get(outcome.instance_id()).unwrap();
        let step = instance.step(0).unwrap();
        assert_eq!(step.state, StepState::Sent);
        assert_eq!(step.attempts, 1);
        assert!(step.sent_at.is_some());
        assert!(step.send_attempted_at.is_none());
        assert_eq!(f.transport.attempt_count(), 1);
    }

    #[tokio::test]
    async fn exactly_one_send_per_dedup_key() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                "a@x.com",
                CampaignKind::ReviewRequest,
                serde_json::json!({"order_number": "A-1001"}),
            )
            .unwrap();

        let due = first_due(&f.store);
        f.executor.execute(&due).await.unwrap();
        // Second execution of the same (no longer Pending) step is a no-op.
        let second = f.executor.execute(&due).await.unwrap();
        assert_eq!(second, ExecutionOutcome::Skipped);

        let key = DedupKey {
            instance_id: outcome.instance_id(),
            step_index: 0,
        };
        assert_eq!(f.transport.sent_count(key), 1);
    }

    #[tokio::test]
    async fn cancellation_wins_the_race_before_send() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                "a@x.com",
                CampaignKind::CartRecovery,
                serde_json::json!({"cart_total": "£22.50", "discount_code": "SAVE10"}),
            )
            .unwrap();

        let due = first_due(&f.store);
        // Cancellation lands after the step was claimed but before execution.
        f.store
            .cancel_instance(outcome.instance_id(), "purchase_completed", Utc::now())
            .unwrap();

        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Skipped);
        assert_eq!(f.transport.attempt_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest("a@x.com", CampaignKind::WelcomeSeries, serde_json::json!({}))
            .unwrap();
        f.transport.push_transient_failures(3, "rate limited");

        let due = first_due(&f.store);
        for expected_attempts in 1..=3u32 {
            let result = f.executor.execute(&due).await.unwrap();
            assert_eq!(
                result,
                ExecutionOutcome::RetryScheduled {
                    attempts: expected_attempts
                }
            );
        }
        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Sent { completed: false });

        let instance = f.store.get(outcome.instance_id()).unwrap();
        let step = instance.step(0).unwrap();
        assert_eq!(step.state, StepState::Sent);
        assert_eq!(step.attempts, 4);

        // Later steps keep their original fire times.
        let trigger = instance.trigger_time;
        assert_eq!(
            instance.step(1).unwrap().scheduled_at,
            trigger + ChronoDuration::days(4)
        );
        assert_eq!(
            instance.step(3).unwrap().scheduled_at,
            trigger + ChronoDuration::days(10)
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_step_but_not_instance() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest("a@x.com", CampaignKind::WelcomeSeries, serde_json::json!({}))
            .unwrap();
        f.transport.push_transient_failures(5, "upstream 503");

        let due = first_due(&f.store);
        for _ in 0..4 {
            f.executor.execute(&due).await.unwrap();
        }
        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Failed);

        let instance = f.store.get(outcome.instance_id()).unwrap();
        assert_eq!(instance.step(0).unwrap().state, StepState::Failed);
        assert_eq!(instance.step(0).unwrap().attempts, 5);
        // A failed promotional step must not block later steps.
        assert_eq!(instance.status, InstanceStatus::Active);
        assert_eq!(instance.step(1).unwrap().state, StepState::Pending);
    }

    #[tokio::test]
    async fn hard_bounce_fails_step_and_cancels_instance() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest("dead@x.com", CampaignKind::WelcomeSeries, serde_json::json!({}))
            .unwrap();
        f.transport
            .push_outcome(Err(DeliveryError::Permanent("hard bounce".to_string())));

        let due = first_due(&f.store);
        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Failed);

        let instance = f.store.get(outcome.instance_id()).unwrap();
        assert_eq!(instance.step(0).unwrap().state, StepState::Failed);
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        assert_eq!(instance.cancel_reason.as_deref(), Some("hard_bounce"));
        assert!(instance
            .steps
            .iter()
            .skip(1)
            .all(|s| s.state == StepState::Skipped));
    }

    #[tokio::test]
    async fn render_failure_fails_step_without_transport_call() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                "a@x.com",
                CampaignKind::CartRecovery,
                // discount_code missing: step 2 will fail to render later;
                // step 0 needs only cart_total and renders fine. Drop
                // cart_total instead so step 0 fails.
                serde_json::json!({}),
            )
            .unwrap();

        let due = first_due(&f.store);
        let result = f.executor.execute(&due).await.unwrap();
        assert_eq!(result, ExecutionOutcome::Failed);

        let instance = f.store.get(outcome.instance_id()).unwrap();
        let step = instance.step(0).unwrap();
        assert_eq!(step.state, StepState::Failed);
        // No transport call, no ambiguous-send marker.
        assert_eq!(f.transport.attempt_count(), 0);
        assert!(step.send_attempted_at.is_none());
        // Later steps still fire.
        assert_eq!(instance.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn last_step_completes_instance() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                "a@x.com",
                CampaignKind::ReviewRequest,
                serde_json::json!({"order_number": "A-1001"}),
            )
            .unwrap();

        let horizon = Utc::now() + ChronoDuration::days(365);
        for due in f.store.due_steps(horizon, 10) {
            f.executor.execute(&due).await.unwrap();
        }

        let instance = f.store.get(outcome.instance_id()).unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(instance.steps.iter().all(|s| s.state == StepState::Sent));

        // Sent timestamps are ordered and each at/after its schedule.
        let sent: Vec<_> = instance
            .steps
            .iter()
            .map(|s| s.sent_at.expect("sent"))
            .collect();
        assert!(sent.windows(2).all(|w| w[0] <= w[1]));
    }
}
