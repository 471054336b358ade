use cadence_core::types::CampaignKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What happens when a trigger arrives while an Active instance already
/// exists for the same `(subject_id, campaign_kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// The duplicate trigger is a no-op; the existing instance id is returned.
    IdempotentCreate,
    /// The existing instance is cancelled and a fresh one starts from the new
    /// trigger time.
    Replace,
}

/// One message in a campaign's ordered list.
///
/// Offsets are relative to the instance trigger time, not to the previous
/// step, so a late-firing step never drifts later steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_index: u32,
    pub offset_secs: i64,
    pub content_key: String,
    /// Name of the disqualifying event that skips this step, if any.
    #[serde(default)]
    pub cancel_if: Option<String>,
}

impl StepDefinition {
    pub fn offset(&self) -> Duration {
        Duration::seconds(self.offset_secs)
    }

    /// Absolute fire time for this step given the instance trigger time.
    pub fn scheduled_at(&self, trigger_time: DateTime<Utc>) -> DateTime<Utc> {
        trigger_time + self.offset()
    }
}

/// Immutable definition of one campaign kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDefinition {
    pub kind: CampaignKind,
    pub name: String,
    pub trigger_policy: TriggerPolicy,
    /// Cancel the whole instance when the transport reports a hard bounce.
    #[serde(default = "default_cancel_on_hard_bounce")]
    pub cancel_on_hard_bounce: bool,
    pub steps: Vec<StepDefinition>,
}

fn default_cancel_on_hard_bounce() -> bool {
    true
}

/// On-disk catalog schema (TOML), deserialized before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogFile {
    pub version: u32,
    pub campaigns: Vec<CampaignDefinition>,
}
