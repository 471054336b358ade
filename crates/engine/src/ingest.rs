//! Trigger Ingestor — turns business events into persisted sequence
//! instances with every step's fire time computed up front.

use std::sync::Arc;

use cadence_catalog::{CampaignCatalog, TriggerPolicy};
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{CampaignKind, EventType};
use cadence_core::{SequencerError, SequencerResult};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use cadence_store::{SequenceInstance, SequenceStore, StepExecution};

/// Result of ingesting a trigger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new instance was created.
    Created { instance_id: Uuid },
    /// An Active instance already existed; the trigger was a no-op.
    AlreadyActive { instance_id: Uuid },
    /// The existing instance was cancelled and replaced by a fresh one.
    Superseded {
        instance_id: Uuid,
        cancelled_instance_id: Uuid,
    },
}

impl IngestOutcome {
    pub fn instance_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created { instance_id }
            | IngestOutcome::AlreadyActive { instance_id }
            | IngestOutcome::Superseded { instance_id, .. } => *instance_id,
        }
    }
}

pub struct TriggerIngestor {
    catalog: Arc<CampaignCatalog>,
    store: Arc<dyn SequenceStore>,
    events: Arc<dyn EventSink>,
}

impl TriggerIngestor {
    pub fn new(
        catalog: Arc<CampaignCatalog>,
        store: Arc<dyn SequenceStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            catalog,
            store,
            events,
        }
    }

    /// Ingest a trigger event at the current time.
    pub fn ingest(
        &self,
        subject_id: &str,
        campaign_kind: CampaignKind,
        binding_data: serde_json::Value,
    ) -> SequencerResult<IngestOutcome> {
        self.ingest_at(subject_id, campaign_kind, binding_data, Utc::now())
    }

    /// Ingest with an explicit trigger time. All step fire times are computed
    /// from it and persisted with the instance in one transaction.
    pub fn ingest_at(
        &self,
        subject_id: &str,
        campaign_kind: CampaignKind,
        binding_data: serde_json::Value,
        trigger_time: DateTime<Utc>,
    ) -> SequencerResult<IngestOutcome> {
        if subject_id.is_empty() {
            return Err(SequencerError::Store("empty subject id".to_string()));
        }
        let definition = self.catalog.require(campaign_kind)?;

        let mut cancelled_instance_id = None;
        if let Some(existing) = self.store.find_active(subject_id, campaign_kind) {
            match definition.trigger_policy {
                TriggerPolicy::IdempotentCreate => {
                    info!(
                        subject_id = %subject_id,
                        campaign = %campaign_kind,
                        instance_id = %existing.instance_id,
                        "Duplicate trigger ignored (idempotent create)"
                    );
                    metrics::counter!(
                        "sequencer.triggers",
                        "campaign" => campaign_kind.as_str(),
                        "outcome" => "deduplicated"
                    )
                    .increment(1);
                    self.events.emit(make_event(
                        EventType::TriggerDeduplicated,
                        existing.instance_id,
                        subject_id,
                        campaign_kind,
                        None,
                        None,
                    ));
                    return Ok(IngestOutcome::AlreadyActive {
                        instance_id: existing.instance_id,
                    });
                }
                TriggerPolicy::Replace => {
                    self.store.cancel_instance(
                        existing.instance_id,
                        "superseded",
                        trigger_time,
                    )?;
                    self.events.emit(make_event(
                        EventType::TriggerSuperseded,
                        existing.instance_id,
                        subject_id,
                        campaign_kind,
                        None,
                        Some("superseded by new trigger".to_string()),
                    ));
                    cancelled_instance_id = Some(existing.instance_id);
                }
            }
        }

        let instance = SequenceInstance {
            instance_id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            campaign_kind,
            catalog_version: self.catalog.version(),
            trigger_time,
            binding_data,
            status: cadence_store::InstanceStatus::Active,
            cancel_reason: None,
            revision: 0,
            created_at: trigger_time,
            updated_at: trigger_time,
            steps: definition
                .steps
                .iter()
                .map(|step| {
                    StepExecution::pending(
                        step.step_index,
                        step.content_key.clone(),
                        step.scheduled_at(trigger_time),
                    )
                })
                .collect(),
        };
        let instance_id = instance.instance_id;

        match self.store.create_instance(instance) {
            Ok(()) => {}
            // Lost a race with a concurrent identical trigger; for an
            // idempotent campaign that is the no-op case.
            Err(SequencerError::DuplicateActive { .. })
                if definition.trigger_policy == TriggerPolicy::IdempotentCreate =>
            {
                if let Some(existing) = self.store.find_active(subject_id, campaign_kind) {
                    return Ok(IngestOutcome::AlreadyActive {
                        instance_id: existing.instance_id,
                    });
                }
                return Err(SequencerError::DuplicateActive {
                    subject_id: subject_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        info!(
            subject_id = %subject_id,
            campaign = %campaign_kind,
            instance_id = %instance_id,
            steps = definition.steps.len(),
            superseded = cancelled_instance_id.is_some(),
            "Sequence instance created"
        );
        metrics::counter!(
            "sequencer.triggers",
            "campaign" => campaign_kind.as_str(),
            "outcome" => "created"
        )
        .increment(1);
        self.events.emit(make_event(
            EventType::TriggerAccepted,
            instance_id,
            subject_id,
            campaign_kind,
            None,
            None,
        ));

        Ok(match cancelled_instance_id {
            Some(cancelled) => IngestOutcome::Superseded {
                instance_id,
                cancelled_instance_id: cancelled,
            },
            None => IngestOutcome::Created { instance_id },
        })
    }
}
