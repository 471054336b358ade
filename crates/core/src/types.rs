use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// The closed set of campaign kinds the sequencer runs. Adding a kind is a
/// code change; changing a kind's steps is a catalog data change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    WelcomeSeries,
    CartRecovery,
    ReviewRequest,
    EducationDrip,
}

impl CampaignKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::WelcomeSeries => "welcome_series",
            CampaignKind::CartRecovery => "cart_recovery",
            CampaignKind::ReviewRequest => "review_request",
            CampaignKind::EducationDrip => "education_drip",
        }
    }
}

impl std::fmt::Display for CampaignKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplication key for a single send: one Delivery Transport call reaches a
/// terminal state per key, absent a crash-recovery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub instance_id: Uuid,
    pub step_index: u32,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.step_index)
    }
}

/// A message produced by the Content Renderer, ready for the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub content_key: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub rendered_at: DateTime<Utc>,
}

/// Failure taxonomy of the Delivery Transport.
///
/// Transient failures (timeout, 5xx, rate-limit) are retried with backoff;
/// permanent failures (invalid address, hard bounce) never retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Lifecycle event emitted by the sequencer into the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub instance_id: Uuid,
    pub subject_id: String,
    pub campaign_kind: CampaignKind,
    pub step_index: Option<u32>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TriggerAccepted,
    TriggerDeduplicated,
    TriggerSuperseded,
    StepSent,
    StepRetryScheduled,
    StepFailed,
    StepSkipped,
    InstanceCompleted,
    InstanceCancelled,
    ReconciliationQueued,
}
