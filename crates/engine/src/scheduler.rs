//! Scheduler — persisted-due-set-plus-poll.
//!
//! Fire times are computed at instance creation and live in the store; the
//! scheduler only asks "what is due now?". There are no in-memory timers to
//! reconstruct, so the first poll after a restart naturally picks up every
//! step that came due while the process was down.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use cadence_core::config::SchedulerConfig;
use cadence_store::SequenceStore;

use crate::executor::Executor;

pub struct Scheduler {
    store: Arc<dyn SequenceStore>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
    /// Steps currently handed to a worker; prevents double dispatch while an
    /// execution is in flight across poll ticks.
    in_flight: Arc<DashMap<(Uuid, u32), ()>>,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        executor: Arc<Executor>,
        config: SchedulerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            store,
            executor,
            config,
            in_flight: Arc::new(DashMap::new()),
            workers,
        }
    }

    /// Run until the shutdown signal flips. In-flight executions finish;
    /// nothing new is dispatched after shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            worker_count = self.config.worker_count,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.dispatch_due().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and dispatch everything due at this tick.
    async fn dispatch_due(&self) {
        let now = Utc::now();
        let due = self.store.due_steps(now, self.config.batch_size);
        if due.is_empty() {
            return;
        }

        for step in due {
            let claim = (step.instance_id, step.step_index);
            if self.in_flight.insert(claim, ()).is_some() {
                continue; // already executing
            }

            let lateness = (now - step.scheduled_at).num_seconds();
            if lateness > self.config.late_warn_secs as i64 {
                // Late is not an error state: fired on recovery, not lost.
                warn!(
                    instance_id = %step.instance_id,
                    step_index = step.step_index,
                    scheduled_at = %step.scheduled_at,
                    lateness_secs = lateness,
                    "Dispatching step past its fire time"
                );
                metrics::counter!("sequencer.steps_late").increment(1);
            }

            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.in_flight.remove(&claim);
                    return; // semaphore closed, shutting down
                }
            };
            let executor = self.executor.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.execute(&step).await {
                    error!(
                        instance_id = %step.instance_id,
                        step_index = step.step_index,
                        error = %e,
                        "Step execution errored"
                    );
                }
                in_flight.remove(&claim);
                drop(permit);
            });
        }
    }
}
