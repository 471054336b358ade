use cadence_core::types::CampaignKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Runtime status of a sequence instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
}

/// Execution state of a single step. Transitions only Pending → {Sent,
/// Skipped, Failed}; never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Sent,
    Skipped,
    Failed,
}

/// Per-step execution record of a sequence instance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StepExecution {
    pub step_index: u32,
    /// Content key snapshotted from the catalog at creation, so a catalog
    /// change never redefines an in-flight sequence.
    pub content_key: String,
    /// Absolute fire time, `trigger_time + offset` at creation; moved forward
    /// only by retry backoff of this same step.
    pub scheduled_at: DateTime<Utc>,
    pub state: StepState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Write-ahead marker: set immediately before the transport call, cleared
    /// when an outcome is recorded. A set marker on a Pending step after
    /// restart means the outcome is unknown.
    pub send_attempted_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn pending(step_index: u32, content_key: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            step_index,
            content_key: content_key.into(),
            scheduled_at,
            state: StepState::Pending,
            attempts: 0,
            last_error: None,
            sent_at: None,
            send_attempted_at: None,
        }
    }
}

/// The stateful run of a campaign for one subject.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SequenceInstance {
    pub instance_id: Uuid,
    pub subject_id: String,
    pub campaign_kind: CampaignKind,
    /// Catalog version active at creation; in-flight instances keep
    /// referencing it even if the catalog changes.
    pub catalog_version: u32,
    pub trigger_time: DateTime<Utc>,
    /// Snapshot of the trigger event payload, captured at creation so later
    /// renders are deterministic even if upstream data changes.
    #[schema(value_type = Object)]
    pub binding_data: serde_json::Value,
    pub status: InstanceStatus,
    /// Reason recorded when the instance was cancelled.
    pub cancel_reason: Option<String>,
    /// Monotonic revision, bumped on every store mutation.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepExecution>,
}

impl SequenceInstance {
    pub fn step(&self, step_index: u32) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_index == step_index)
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// A step due for execution, as yielded by the scheduler query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueStep {
    pub instance_id: Uuid,
    pub step_index: u32,
    pub scheduled_at: DateTime<Utc>,
}

/// Operator-facing record of a send whose outcome is unknown after a crash.
/// The step still fires (at-least-once), but the possible duplicate is
/// surfaced here instead of silently resolved either way.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationEntry {
    pub instance_id: Uuid,
    pub subject_id: String,
    pub campaign_kind: CampaignKind,
    pub step_index: u32,
    pub send_attempted_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}
