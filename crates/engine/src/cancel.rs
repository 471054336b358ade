//! Cancellation Gateway — stops further steps when a disqualifying event
//! arrives (purchase completed, review submitted, unsubscribe).
//!
//! The store transition is atomic; the in-flight race with the Executor is
//! closed by the Executor's re-read immediately before send.

use std::sync::Arc;

use cadence_catalog::CampaignCatalog;
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{CampaignKind, EventType};
use cadence_core::SequencerResult;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use cadence_store::SequenceStore;

pub struct CancellationGateway {
    catalog: Arc<CampaignCatalog>,
    store: Arc<dyn SequenceStore>,
    events: Arc<dyn EventSink>,
}

impl CancellationGateway {
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

    /// Cancel the Active instance for `(subject_id, campaign_kind)`, if any.
    /// Returns the cancelled instance id.
    pub fn cancel(
        &self,
        subject_id: &str,
        campaign_kind: CampaignKind,
        reason: &str,
    ) -> SequencerResult<Option<Uuid>> {
        let Some(instance) = self.store.find_active(subject_id, campaign_kind) else {
            return Ok(None);
        };

        let cancelled = self
            .store
            .cancel_instance(instance.instance_id, reason, Utc::now())?;

        match cancelled {
            Some(instance) => {
                info!(
                    subject_id = %subject_id,
                    campaign = %campaign_kind,
                    instance_id = %instance.instance_id,
                    reason = reason,
                    "Sequence instance cancelled"
                );
                metrics::counter!(
                    "sequencer.cancellations",
                    "campaign" => campaign_kind.as_str()
                )
                .increment(1);
                self.events.emit(make_event(
                    EventType::InstanceCancelled,
                    instance.instance_id,
                    subject_id,
                    campaign_kind,
                    None,
                    Some(reason.to_string()),
                ));
                Ok(Some(instance.instance_id))
            }
            // The instance reached a terminal state between lookup and
            // cancel; nothing left to stop.
            None => Ok(None),
        }
    }

    /// Route a disqualifying business event to every campaign kind whose
    /// catalog steps name it, cancelling each matching Active instance.
    pub fn handle_disqualifying_event(
        &self,
        subject_id: &str,
        event_name: &str,
    ) -> SequencerResult<Vec<Uuid>> {
        let mut cancelled = Vec::new();
        for kind in self.catalog.kinds_cancelled_by(event_name) {
            if let Some(instance_id) = self.cancel(subject_id, kind, event_name)? {
                cancelled.push(instance_id);
            }
        }
        Ok(cancelled)
    }
}
