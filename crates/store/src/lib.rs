//! Sequence store — durable record of every sequence instance and its
//! per-step execution status. Source of truth; the only component allowed to
//! mutate instance state.
//!
//! Two implementations share one state core: [`MemoryStore`] for development
//! and tests, and [`JournalStore`], which appends every transition to a
//! JSON-lines journal and replays it on open, so pending work survives
//! process interruption.

pub mod journal;
pub mod memory;
mod state;
pub mod types;

use cadence_core::types::CampaignKind;
use cadence_core::SequencerResult;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use types::{
    DueStep, InstanceStatus, ReconciliationEntry, SequenceInstance, StepExecution, StepState,
};

/// Atomic, high-level transitions over sequence instances. Every method is a
/// single transaction: instance + step changes made by one call are never
/// partially observable, including across a restart.
pub trait SequenceStore: Send + Sync {
    /// Persist a new Active instance with all its Pending steps. Fails with
    /// `DuplicateActive` if the `(subject_id, campaign_kind)` pair already
    /// has an Active instance.
    fn create_instance(&self, instance: SequenceInstance) -> SequencerResult<()>;

    fn get(&self, instance_id: Uuid) -> Option<SequenceInstance>;

    fn find_active(&self, subject_id: &str, kind: CampaignKind) -> Option<SequenceInstance>;

    fn list_for_subject(&self, subject_id: &str) -> Vec<SequenceInstance>;

    /// Pending steps of Active instances due at `now`, ordered by fire time.
    fn due_steps(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueStep>;

    /// Write-ahead marker persisted immediately before the transport call.
    fn mark_send_attempted(
        &self,
        instance_id: Uuid,
        step_index: u32,
        at: DateTime<Utc>,
    ) -> SequencerResult<()>;

    /// Mark a step Sent. `last_step` completes the instance; returns true if
    /// the instance transitioned to Completed.
    fn record_sent(
        &self,
        instance_id: Uuid,
        step_index: u32,
        sent_at: DateTime<Utc>,
        last_step: bool,
    ) -> SequencerResult<bool>;

    /// Transient failure: bump attempts, reschedule this step only. Returns
    /// the new attempt count.
    fn record_retry(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> SequencerResult<u32>;

    /// Terminal step failure; the instance stays Active.
    fn record_failed(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()>;

    fn skip_step(
        &self,
        instance_id: Uuid,
        step_index: u32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()>;

    /// Atomically cancel an Active instance and skip its remaining Pending
    /// steps. Returns the updated instance, or None if it was not Active.
    fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<Option<SequenceInstance>>;

    /// Operator queue of sends with unknown outcome after a crash.
    fn reconciliation_queue(&self) -> Vec<ReconciliationEntry>;

    fn instance_count(&self) -> usize;
}
