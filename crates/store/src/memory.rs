//! In-memory sequence store for development and tests.
//!
//! Same transition semantics as the journal store, without durability.

use cadence_core::types::CampaignKind;
use cadence_core::SequencerResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::state::StoreState;
use crate::types::{DueStep, ReconciliationEntry, SequenceInstance};
use crate::SequenceStore;

pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Sequence store initialized (in-memory, development mode)");
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore for MemoryStore {
    fn create_instance(&self, instance: SequenceInstance) -> SequencerResult<()> {
        self.state.write().create_instance(instance)
    }

    fn get(&self, instance_id: Uuid) -> Option<SequenceInstance> {
        self.state.read().get(instance_id)
    }

    fn find_active(&self, subject_id: &str, kind: CampaignKind) -> Option<SequenceInstance> {
        self.state.read().find_active(subject_id, kind)
    }

    fn list_for_subject(&self, subject_id: &str) -> Vec<SequenceInstance> {
        self.state.read().list_for_subject(subject_id)
    }

    fn due_steps(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueStep> {
        self.state.read().due_steps(now, limit)
    }

    fn mark_send_attempted(
        &self,
        instance_id: Uuid,
        step_index: u32,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        self.state.write().mark_send_attempted(instance_id, step_index, at)
    }

    fn record_sent(
        &self,
        instance_id: Uuid,
        step_index: u32,
        sent_at: DateTime<Utc>,
        last_step: bool,
    ) -> SequencerResult<bool> {
        self.state
            .write()
            .record_sent(instance_id, step_index, sent_at, last_step)
    }

    fn record_retry(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> SequencerResult<u32> {
        self.state
            .write()
            .record_retry(instance_id, step_index, error, next_attempt_at, at)
    }

    fn record_failed(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        self.state
            .write()
            .record_failed(instance_id, step_index, error, at)
    }

    fn skip_step(
        &self,
        instance_id: Uuid,
        step_index: u32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        self.state
            .write()
            .skip_step(instance_id, step_index, reason, at)
    }

    fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<Option<SequenceInstance>> {
        self.state.write().cancel_instance(instance_id, reason, at)
    }

    fn reconciliation_queue(&self) -> Vec<ReconciliationEntry> {
        self.state.read().reconciliation_queue()
    }

    fn instance_count(&self) -> usize {
        self.state.read().instance_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceStatus, StepExecution, StepState};
    use chrono::Duration;

    fn make_instance(subject: &str, kind: CampaignKind, offsets: &[i64]) -> SequenceInstance {
        let now = Utc::now();
        SequenceInstance {
            instance_id: Uuid::new_v4(),
            subject_id: subject.to_string(),
            campaign_kind: kind,
            catalog_version: 1,
            trigger_time: now,
            binding_data: serde_json::json!({"cart_total": "£22.50"}),
            status: InstanceStatus::Active,
            cancel_reason: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            steps: offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| {
                    StepExecution::pending(
                        i as u32,
                        format!("step_{i}"),
                        now + Duration::seconds(*offset),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn enforces_single_active_instance_per_pair() {
        let store = MemoryStore::new();
        let first = make_instance("a@x.com", CampaignKind::WelcomeSeries, &[10, 20]);
        store.create_instance(first.clone()).unwrap();

        let second = make_instance("a@x.com", CampaignKind::WelcomeSeries, &[10, 20]);
        assert!(store.create_instance(second).is_err());

        // A different campaign kind for the same subject is fine.
        let other = make_instance("a@x.com", CampaignKind::CartRecovery, &[10]);
        store.create_instance(other).unwrap();
    }

    #[test]
    fn due_steps_ordered_and_filtered() {
        let store = MemoryStore::new();
        let early = make_instance("a@x.com", CampaignKind::CartRecovery, &[-120, 3600]);
        let later = make_instance("b@x.com", CampaignKind::CartRecovery, &[-60]);
        store.create_instance(early.clone()).unwrap();
        store.create_instance(later.clone()).unwrap();

        let due = store.due_steps(Utc::now(), 10);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].instance_id, early.instance_id);
        assert_eq!(due[0].step_index, 0);
        assert_eq!(due[1].instance_id, later.instance_id);
    }

    #[test]
    fn cancel_skips_pending_steps_atomically() {
        let store = MemoryStore::new();
        let instance = make_instance("a@x.com", CampaignKind::CartRecovery, &[-60, 3600, 7200]);
        store.create_instance(instance.clone()).unwrap();

        // First step already sent.
        store
            .record_sent(instance.instance_id, 0, Utc::now(), false)
            .unwrap();

        let cancelled = store
            .cancel_instance(instance.instance_id, "purchase_completed", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert_eq!(cancelled.step(0).unwrap().state, StepState::Sent);
        assert_eq!(cancelled.step(1).unwrap().state, StepState::Skipped);
        assert_eq!(cancelled.step(2).unwrap().state, StepState::Skipped);

        // Second cancel is a no-op.
        assert!(store
            .cancel_instance(instance.instance_id, "again", Utc::now())
            .unwrap()
            .is_none());

        // The uniqueness slot is free again.
        let fresh = make_instance("a@x.com", CampaignKind::CartRecovery, &[60]);
        store.create_instance(fresh).unwrap();
    }

    #[test]
    fn step_transitions_never_reverse() {
        let store = MemoryStore::new();
        let instance = make_instance("a@x.com", CampaignKind::ReviewRequest, &[-60, 60]);
        store.create_instance(instance.clone()).unwrap();

        store
            .record_sent(instance.instance_id, 0, Utc::now(), false)
            .unwrap();
        assert!(store
            .record_sent(instance.instance_id, 0, Utc::now(), false)
            .is_err());
        assert!(store
            .skip_step(instance.instance_id, 0, "late cancel", Utc::now())
            .is_err());
    }

    #[test]
    fn last_step_completes_instance() {
        let store = MemoryStore::new();
        let instance = make_instance("a@x.com", CampaignKind::ReviewRequest, &[-120, -60]);
        store.create_instance(instance.clone()).unwrap();

        assert!(!store
            .record_sent(instance.instance_id, 0, Utc::now(), false)
            .unwrap());
        assert!(store
            .record_sent(instance.instance_id, 1, Utc::now(), true)
            .unwrap());

        let done = store.get(instance.instance_id).unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(store
            .find_active("a@x.com", CampaignKind::ReviewRequest)
            .is_none());
    }

    #[test]
    fn retry_moves_only_the_failed_step() {
        let store = MemoryStore::new();
        let instance = make_instance("a@x.com", CampaignKind::WelcomeSeries, &[-60, 3600]);
        store.create_instance(instance.clone()).unwrap();

        let original_later = store.get(instance.instance_id).unwrap().step(1).unwrap().scheduled_at;
        let backoff_at = Utc::now() + Duration::seconds(60);
        let attempts = store
            .record_retry(instance.instance_id, 0, "timeout", backoff_at, Utc::now())
            .unwrap();
        assert_eq!(attempts, 1);

        let updated = store.get(instance.instance_id).unwrap();
        assert_eq!(updated.step(0).unwrap().scheduled_at, backoff_at);
        assert_eq!(updated.step(0).unwrap().last_error.as_deref(), Some("timeout"));
        assert_eq!(updated.step(1).unwrap().scheduled_at, original_later);
    }
}
