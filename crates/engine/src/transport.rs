//! Delivery Transport contract — the external collaborator that actually
//! transmits messages (SMTP, provider API).
//!
//! The engine calls `send` at most once per dedup key reaching a terminal
//! state; after a crash between the write-ahead marker and the recorded
//! outcome, a re-send is possible and is surfaced on the reconciliation
//! queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use cadence_core::types::{DedupKey, DeliveryError, RenderedMessage};
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Transmit a message. Returns the provider's delivery id.
    async fn send(
        &self,
        subject_id: &str,
        message: &RenderedMessage,
        dedup_key: DedupKey,
    ) -> Result<String, DeliveryError>;
}

/// Development transport: logs the message and fabricates a delivery id.
pub struct LogTransport;

#[async_trait]
impl DeliveryTransport for LogTransport {
    async fn send(
        &self,
        subject_id: &str,
        message: &RenderedMessage,
        dedup_key: DedupKey,
    ) -> Result<String, DeliveryError> {
        let delivery_id = format!("dev-{}", Uuid::new_v4());
        info!(
            subject_id = %subject_id,
            content_key = %message.content_key,
            dedup_key = %dedup_key,
            delivery_id = %delivery_id,
            "Delivery transport (dev mode): message logged, not sent"
        );
        Ok(delivery_id)
    }
}

/// One transport call observed by [`CaptureTransport`].
#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub subject_id: String,
    pub dedup_key: DedupKey,
    pub content_key: String,
    pub outcome: Result<String, DeliveryError>,
}

/// In-memory transport that records every call and can be scripted to fail.
/// Used by tests.
#[derive(Default)]
pub struct CaptureTransport {
    attempts: Mutex<Vec<SendAttempt>>,
    /// Outcomes consumed in order before falling back to success.
    script: Mutex<VecDeque<Result<String, DeliveryError>>>,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for an upcoming send, consumed FIFO.
    pub fn push_outcome(&self, outcome: Result<String, DeliveryError>) {
        self.script
            .lock()
            .expect("transport mutex poisoned")
            .push_back(outcome);
    }

    pub fn push_transient_failures(&self, count: usize, message: &str) {
        for _ in 0..count {
            self.push_outcome(Err(DeliveryError::Transient(message.to_string())));
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("transport mutex poisoned").len()
    }

    /// Successful sends recorded for the given dedup key.
    pub fn sent_count(&self, dedup_key: DedupKey) -> usize {
        self.attempts
            .lock()
            .expect("transport mutex poisoned")
            .iter()
            .filter(|a| a.dedup_key == dedup_key && a.outcome.is_ok())
            .count()
    }
}

#[async_trait]
impl DeliveryTransport for CaptureTransport {
    async fn send(
        &self,
        subject_id: &str,
        message: &RenderedMessage,
        dedup_key: DedupKey,
    ) -> Result<String, DeliveryError> {
        let outcome = self
            .script
            .lock()
            .expect("transport mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("cap-{}", Uuid::new_v4())));

        debug!(dedup_key = %dedup_key, ok = outcome.is_ok(), "Capture transport send");

        self.attempts
            .lock()
            .expect("transport mutex poisoned")
            .push(SendAttempt {
                subject_id: subject_id.to_string(),
                dedup_key,
                content_key: message.content_key.clone(),
                outcome: outcome.clone(),
            });

        outcome
    }
}
