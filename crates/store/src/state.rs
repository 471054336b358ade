//! Shared mutable state behind both store implementations.
//!
//! Every public store operation maps to exactly one method here, executed
//! under a single write lock, so instance + step transitions are atomic:
//! partial mutations are never observable.

use std::collections::HashMap;

use cadence_core::types::CampaignKind;
use cadence_core::{SequencerError, SequencerResult};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{
    DueStep, InstanceStatus, ReconciliationEntry, SequenceInstance, StepState,
};

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    instances: HashMap<Uuid, SequenceInstance>,
    /// Uniqueness index: at most one Active instance per (subject, kind).
    active: HashMap<(String, CampaignKind), Uuid>,
    reconciliation: Vec<ReconciliationEntry>,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Reads ─────────────────────────────────────────────────────────────

    pub fn get(&self, instance_id: Uuid) -> Option<SequenceInstance> {
        self.instances.get(&instance_id).cloned()
    }

    pub fn find_active(&self, subject_id: &str, kind: CampaignKind) -> Option<SequenceInstance> {
        self.active
            .get(&(subject_id.to_string(), kind))
            .and_then(|id| self.instances.get(id))
            .cloned()
    }

    pub fn list_for_subject(&self, subject_id: &str) -> Vec<SequenceInstance> {
        let mut instances: Vec<SequenceInstance> = self
            .instances
            .values()
            .filter(|i| i.subject_id == subject_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        instances
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Pending steps of Active instances with `scheduled_at <= now`, ordered
    /// by fire time.
    pub fn due_steps(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueStep> {
        let mut due: Vec<DueStep> = self
            .instances
            .values()
            .filter(|i| i.is_active())
            .flat_map(|i| {
                i.steps
                    .iter()
                    .filter(|s| s.state == StepState::Pending && s.scheduled_at <= now)
                    .map(|s| DueStep {
                        instance_id: i.instance_id,
                        step_index: s.step_index,
                        scheduled_at: s.scheduled_at,
                    })
            })
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then(a.instance_id.cmp(&b.instance_id))
                .then(a.step_index.cmp(&b.step_index))
        });
        due.truncate(limit);
        due
    }

    pub fn reconciliation_queue(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation.clone()
    }

    pub fn snapshot(&self) -> (Vec<SequenceInstance>, Vec<ReconciliationEntry>) {
        let mut instances: Vec<SequenceInstance> = self.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        (instances, self.reconciliation.clone())
    }

    // ─── Mutations ─────────────────────────────────────────────────────────

    pub fn create_instance(&mut self, instance: SequenceInstance) -> SequencerResult<()> {
        if instance.status != InstanceStatus::Active {
            return Err(SequencerError::Store(
                "new instances must be Active".to_string(),
            ));
        }
        let key = (instance.subject_id.clone(), instance.campaign_kind);
        if self.active.contains_key(&key) {
            return Err(SequencerError::DuplicateActive {
                subject_id: instance.subject_id,
            });
        }
        if self.instances.contains_key(&instance.instance_id) {
            return Err(SequencerError::Store(format!(
                "instance id collision: {}",
                instance.instance_id
            )));
        }
        self.active.insert(key, instance.instance_id);
        self.instances.insert(instance.instance_id, instance);
        Ok(())
    }

    pub fn mark_send_attempted(
        &mut self,
        instance_id: Uuid,
        step_index: u32,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let instance = self.instance_mut(instance_id)?;
        let step = step_mut(instance, step_index)?;
        if step.state != StepState::Pending {
            return Err(SequencerError::Store(format!(
                "cannot attempt send for step {step_index} in state {:?}",
                step.state
            )));
        }
        step.send_attempted_at = Some(at);
        touch(instance, at);
        Ok(())
    }

    /// Mark a step Sent; completes the instance when it was the final step.
    /// Returns true if the instance transitioned to Completed.
    pub fn record_sent(
        &mut self,
        instance_id: Uuid,
        step_index: u32,
        sent_at: DateTime<Utc>,
        last_step: bool,
    ) -> SequencerResult<bool> {
        let instance = self.instance_mut(instance_id)?;
        let step = require_pending(instance, step_index)?;
        step.state = StepState::Sent;
        step.attempts += 1;
        step.sent_at = Some(sent_at);
        step.send_attempted_at = None;
        step.last_error = None;

        let completed = last_step && instance.status == InstanceStatus::Active;
        if completed {
            instance.status = InstanceStatus::Completed;
            let key = (instance.subject_id.clone(), instance.campaign_kind);
            touch(instance, sent_at);
            self.active.remove(&key);
        } else {
            touch(instance, sent_at);
        }
        Ok(completed)
    }

    /// Record a transient failure: bump attempts and move this step's (and
    /// only this step's) `scheduled_at` forward to the backoff time.
    /// Returns the new attempt count.
    pub fn record_retry(
        &mut self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> SequencerResult<u32> {
        let instance = self.instance_mut(instance_id)?;
        let step = require_pending(instance, step_index)?;
        step.attempts += 1;
        step.last_error = Some(error.to_string());
        step.scheduled_at = next_attempt_at;
        step.send_attempted_at = None;
        let attempts = step.attempts;
        touch(instance, at);
        Ok(attempts)
    }

    /// Terminal failure of a step. The instance stays Active so subsequent
    /// steps still fire.
    pub fn record_failed(
        &mut self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let instance = self.instance_mut(instance_id)?;
        let step = require_pending(instance, step_index)?;
        step.state = StepState::Failed;
        step.attempts += 1;
        step.last_error = Some(error.to_string());
        step.send_attempted_at = None;
        touch(instance, at);
        Ok(())
    }

    pub fn skip_step(
        &mut self,
        instance_id: Uuid,
        step_index: u32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let instance = self.instance_mut(instance_id)?;
        let step = require_pending(instance, step_index)?;
        step.state = StepState::Skipped;
        step.last_error = Some(reason.to_string());
        step.send_attempted_at = None;
        touch(instance, at);
        Ok(())
    }

    /// Cancel an Active instance: the status change and the skip of every
    /// remaining Pending step happen under the same lock, in one transition.
    /// Returns the updated instance, or None if it was not Active.
    pub fn cancel_instance(
        &mut self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<Option<SequenceInstance>> {
        let instance = self.instance_mut(instance_id)?;
        if instance.status != InstanceStatus::Active {
            return Ok(None);
        }
        instance.status = InstanceStatus::Cancelled;
        instance.cancel_reason = Some(reason.to_string());
        for step in instance.steps.iter_mut() {
            if step.state == StepState::Pending {
                step.state = StepState::Skipped;
                step.last_error = Some(reason.to_string());
                step.send_attempted_at = None;
            }
        }
        touch(instance, at);
        let key = (instance.subject_id.clone(), instance.campaign_kind);
        let cancelled = instance.clone();
        self.active.remove(&key);
        Ok(Some(cancelled))
    }

    pub fn push_reconciliation(&mut self, entry: ReconciliationEntry) {
        self.reconciliation.push(entry);
    }

    /// Scan for Pending steps with a dangling write-ahead marker (crash
    /// between marker and outcome) and queue them for operator review.
    /// Returns the entries queued by this scan. A marker already queued by a
    /// previous restart is not queued twice.
    pub fn queue_ambiguous_outcomes(&mut self, now: DateTime<Utc>) -> Vec<ReconciliationEntry> {
        let mut queued = Vec::new();
        for instance in self.instances.values() {
            for step in &instance.steps {
                if step.state == StepState::Pending {
                    if let Some(attempted_at) = step.send_attempted_at {
                        let already_queued = self.reconciliation.iter().any(|e| {
                            e.instance_id == instance.instance_id
                                && e.step_index == step.step_index
                                && e.send_attempted_at == attempted_at
                        });
                        if already_queued {
                            continue;
                        }
                        queued.push(ReconciliationEntry {
                            instance_id: instance.instance_id,
                            subject_id: instance.subject_id.clone(),
                            campaign_kind: instance.campaign_kind,
                            step_index: step.step_index,
                            send_attempted_at: attempted_at,
                            queued_at: now,
                        });
                    }
                }
            }
        }
        self.reconciliation.extend(queued.iter().cloned());
        queued
    }

    pub fn restore(
        &mut self,
        instances: Vec<SequenceInstance>,
        reconciliation: Vec<ReconciliationEntry>,
    ) {
        self.instances.clear();
        self.active.clear();
        for instance in instances {
            if instance.status == InstanceStatus::Active {
                self.active.insert(
                    (instance.subject_id.clone(), instance.campaign_kind),
                    instance.instance_id,
                );
            }
            self.instances.insert(instance.instance_id, instance);
        }
        self.reconciliation = reconciliation;
    }

    fn instance_mut(&mut self, instance_id: Uuid) -> SequencerResult<&mut SequenceInstance> {
        self.instances
            .get_mut(&instance_id)
            .ok_or(SequencerError::InstanceNotFound(instance_id))
    }
}

fn step_mut(
    instance: &mut SequenceInstance,
    step_index: u32,
) -> SequencerResult<&mut crate::types::StepExecution> {
    let instance_id = instance.instance_id;
    instance
        .steps
        .iter_mut()
        .find(|s| s.step_index == step_index)
        .ok_or_else(|| {
            SequencerError::Store(format!(
                "step {step_index} not found on instance {instance_id}"
            ))
        })
}

fn require_pending(
    instance: &mut SequenceInstance,
    step_index: u32,
) -> SequencerResult<&mut crate::types::StepExecution> {
    let step = step_mut(instance, step_index)?;
    if step.state != StepState::Pending {
        return Err(SequencerError::Store(format!(
            "step {step_index} already terminal: {:?}",
            step.state
        )));
    }
    Ok(step)
}

fn touch(instance: &mut SequenceInstance, at: DateTime<Utc>) {
    instance.revision += 1;
    instance.updated_at = at;
}
