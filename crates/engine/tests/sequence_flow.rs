//! End-to-end sequencer flows over the durable journal store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use cadence_catalog::CampaignCatalog;
use cadence_core::event_bus::capture_sink;
use cadence_core::types::{CampaignKind, EventType};
use cadence_engine::{
    CancellationGateway, CaptureTransport, ExecutionOutcome, Executor, RetryPolicy,
    TemplateRenderer, TriggerIngestor,
};
use cadence_store::{InstanceStatus, JournalStore, SequenceStore, StepState};

fn build_executor(
    store: Arc<dyn SequenceStore>,
    transport: Arc<CaptureTransport>,
) -> Executor {
    Executor::new(
        store,
        Arc::new(CampaignCatalog::builtin()),
        Arc::new(TemplateRenderer::builtin()),
        transport,
        RetryPolicy::default(),
        cadence_core::event_bus::noop_sink(),
        Duration::from_secs(5),
    )
}

/// Cart recovery: step 1 fires at T0+1h, a purchase at T0+2h cancels the
/// rest. Expected: step 1 Sent, steps 2 and 3 Skipped, instance Cancelled.
#[tokio::test]
async fn cart_recovery_cancelled_after_first_reminder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequences.journal");

    let catalog = Arc::new(CampaignCatalog::builtin());
    let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
    let sink = capture_sink();
    let transport = Arc::new(CaptureTransport::new());

    let ingestor = TriggerIngestor::new(catalog.clone(), store.clone(), sink.clone());
    let gateway = CancellationGateway::new(catalog.clone(), store.clone(), sink.clone());
    let executor = build_executor(store.clone(), transport.clone());

    // Abandonment at T0 = 2h ago; the 1h reminder is due, the 24h/72h steps
    // are not.
    let t0 = Utc::now() - ChronoDuration::hours(2);
    let outcome = ingestor
        .ingest_at(
            "a@x.com",
            CampaignKind::CartRecovery,
            serde_json::json!({"cart_total": "£22.50", "discount_code": "SAVE10"}),
            t0,
        )
        .unwrap();
    let instance_id = outcome.instance_id();

    let due = store.due_steps(Utc::now(), 10);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].step_index, 0);
    let result = executor.execute(&due[0]).await.unwrap();
    assert_eq!(result, ExecutionOutcome::Sent { completed: false });

    // "Purchase completed" arrives.
    let cancelled = gateway
        .handle_disqualifying_event("a@x.com", "purchase_completed")
        .unwrap();
    assert_eq!(cancelled, vec![instance_id]);

    let instance = store.get(instance_id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
    assert_eq!(instance.step(0).unwrap().state, StepState::Sent);
    assert_eq!(instance.step(1).unwrap().state, StepState::Skipped);
    assert_eq!(instance.step(2).unwrap().state, StepState::Skipped);

    // Nothing is due any more, ever.
    assert!(store
        .due_steps(Utc::now() + ChronoDuration::days(30), 10)
        .is_empty());
    assert_eq!(sink.count_type(EventType::InstanceCancelled), 1);
}

/// Killing the process between trigger creation and a step's fire time, then
/// restarting, still fires the step: late, never lost.
#[tokio::test]
async fn restart_between_trigger_and_fire_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequences.journal");

    let trigger_time = Utc::now() - ChronoDuration::minutes(90);
    let instance_id;
    {
        let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
        let ingestor = TriggerIngestor::new(
            Arc::new(CampaignCatalog::builtin()),
            store.clone(),
            cadence_core::event_bus::noop_sink(),
        );
        let outcome = ingestor
            .ingest_at(
                "b@x.com",
                CampaignKind::CartRecovery,
                serde_json::json!({"cart_total": "£9.99", "discount_code": "SAVE10"}),
                trigger_time,
            )
            .unwrap();
        instance_id = outcome.instance_id();
    } // process dies before the 1h step fires

    let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
    let transport = Arc::new(CaptureTransport::new());
    let executor = build_executor(store.clone(), transport.clone());

    let due = store.due_steps(Utc::now(), 10);
    assert_eq!(due.len(), 1, "recovered step must be due after restart");
    assert_eq!(due[0].instance_id, instance_id);

    let result = executor.execute(&due[0]).await.unwrap();
    assert_eq!(result, ExecutionOutcome::Sent { completed: false });
    assert_eq!(transport.attempt_count(), 1);

    let instance = store.get(instance_id).unwrap();
    assert!(instance.step(0).unwrap().sent_at.unwrap() >= instance.step(0).unwrap().scheduled_at);
}

/// Crash after the write-ahead marker: the step is surfaced for operator
/// reconciliation and still fires on recovery (at-least-once, never lost).
#[tokio::test]
async fn ambiguous_send_is_reconciled_and_refired() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequences.journal");

    let instance_id;
    {
        let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
        let ingestor = TriggerIngestor::new(
            Arc::new(CampaignCatalog::builtin()),
            store.clone(),
            cadence_core::event_bus::noop_sink(),
        );
        let outcome = ingestor
            .ingest_at(
                "c@x.com",
                CampaignKind::ReviewRequest,
                serde_json::json!({"order_number": "A-1001"}),
                Utc::now() - ChronoDuration::days(8),
            )
            .unwrap();
        instance_id = outcome.instance_id();

        // Simulate a crash mid-send: marker persisted, no outcome.
        store
            .mark_send_attempted(instance_id, 0, Utc::now())
            .unwrap();
    }

    let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
    let queue = store.reconciliation_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].instance_id, instance_id);
    assert_eq!(queue[0].step_index, 0);

    let transport = Arc::new(CaptureTransport::new());
    let executor = build_executor(store.clone(), transport.clone());
    let due = store.due_steps(Utc::now(), 10);
    assert_eq!(due.len(), 1);
    let result = executor.execute(&due[0]).await.unwrap();
    assert_eq!(result, ExecutionOutcome::Sent { completed: false });
}

/// Welcome series with three transient failures on one step: the step ends
/// Sent with attempts = 4 and the later steps keep their original schedule.
#[tokio::test]
async fn transient_failures_do_not_drift_later_steps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequences.journal");

    let store: Arc<dyn SequenceStore> = Arc::new(JournalStore::open(&path).unwrap());
    let transport = Arc::new(CaptureTransport::new());
    let ingestor = TriggerIngestor::new(
        Arc::new(CampaignCatalog::builtin()),
        store.clone(),
        cadence_core::event_bus::noop_sink(),
    );
    let executor = build_executor(store.clone(), transport.clone());

    let t0 = Utc::now() - ChronoDuration::days(2);
    let outcome = ingestor
        .ingest_at(
            "d@x.com",
            CampaignKind::WelcomeSeries,
            serde_json::json!({}),
            t0,
        )
        .unwrap();

    transport.push_transient_failures(3, "connection reset");

    let due = store.due_steps(Utc::now(), 10);
    assert_eq!(due.len(), 1);
    for _ in 0..3 {
        let result = executor.execute(&due[0]).await.unwrap();
        assert!(matches!(result, ExecutionOutcome::RetryScheduled { .. }));
    }
    let result = executor.execute(&due[0]).await.unwrap();
    assert_eq!(result, ExecutionOutcome::Sent { completed: false });

    let instance = store.get(outcome.instance_id()).unwrap();
    assert_eq!(instance.step(0).unwrap().attempts, 4);
    assert_eq!(instance.step(0).unwrap().state, StepState::Sent);
    assert_eq!(instance.step(1).unwrap().scheduled_at, t0 + ChronoDuration::days(4));
    assert_eq!(instance.step(2).unwrap().scheduled_at, t0 + ChronoDuration::days(7));
    assert_eq!(instance.step(3).unwrap().scheduled_at, t0 + ChronoDuration::days(10));
}
