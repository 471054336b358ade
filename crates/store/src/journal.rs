//! Durable sequence store backed by an append-only JSON-lines journal.
//!
//! Every store transition appends exactly one record; opening the journal
//! replays all records to rebuild the in-memory state. Fire times are data,
//! not timers, so the due set survives any process interruption: steps that
//! came due while the process was down are simply returned by the first
//! `due_steps` query after restart.
//!
//! A Pending step found with a dangling `send_attempted_at` marker during
//! replay is a send with unknown outcome. It stays due (at-least-once) and is
//! queued on the operator reconciliation queue.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use cadence_core::types::CampaignKind;
use cadence_core::{SequencerError, SequencerResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::StoreState;
use crate::types::{DueStep, ReconciliationEntry, SequenceInstance};
use crate::SequenceStore;

/// Bumped on incompatible record changes; replay rejects unknown formats.
const JOURNAL_FORMAT: u32 = 1;

/// One journal line. Each variant corresponds to one atomic store transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Header {
        format: u32,
    },
    Snapshot {
        format: u32,
        instances: Vec<SequenceInstance>,
        reconciliation: Vec<ReconciliationEntry>,
    },
    InstanceCreated {
        instance: SequenceInstance,
    },
    SendAttempted {
        instance_id: Uuid,
        step_index: u32,
        at: DateTime<Utc>,
    },
    StepSent {
        instance_id: Uuid,
        step_index: u32,
        sent_at: DateTime<Utc>,
        last_step: bool,
    },
    StepRetryScheduled {
        instance_id: Uuid,
        step_index: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    StepFailed {
        instance_id: Uuid,
        step_index: u32,
        error: String,
        at: DateTime<Utc>,
    },
    StepSkipped {
        instance_id: Uuid,
        step_index: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    InstanceCancelled {
        instance_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    ReconciliationQueued {
        entries: Vec<ReconciliationEntry>,
    },
}

pub struct JournalStore {
    state: RwLock<StoreState>,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JournalStore {
    /// Open (or create) a journal, replay it, and queue ambiguous outcomes.
    pub fn open(path: impl AsRef<Path>) -> SequencerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut state = StoreState::new();
        let existing = path.exists();
        let mut replayed = 0usize;

        if existing {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                    SequencerError::Store(format!(
                        "corrupt journal {} at line {}: {e}",
                        path.display(),
                        line_no + 1
                    ))
                })?;
                apply_record(&mut state, record)?;
                replayed += 1;
            }
        }

        let ambiguous = state.queue_ambiguous_outcomes(Utc::now());
        for entry in &ambiguous {
            warn!(
                instance_id = %entry.instance_id,
                step_index = entry.step_index,
                attempted_at = %entry.send_attempted_at,
                "Send outcome unknown after restart; queued for reconciliation"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let store = Self {
            state: RwLock::new(state),
            writer: Mutex::new(BufWriter::new(file)),
            path,
        };

        if !existing {
            store.append(&JournalRecord::Header {
                format: JOURNAL_FORMAT,
            })?;
        } else if !ambiguous.is_empty() {
            store.append(&JournalRecord::ReconciliationQueued { entries: ambiguous })?;
        }

        info!(
            path = %store.path.display(),
            records = replayed,
            instances = store.state.read().instance_count(),
            "Sequence journal opened"
        );
        Ok(store)
    }

    /// Rewrite the journal as a single snapshot of current state. Bounds
    /// journal growth; typically run right after open.
    pub fn compact(&self) -> SequencerResult<()> {
        let state = self.state.write();
        let (instances, reconciliation) = state.snapshot();
        let record = JournalRecord::Snapshot {
            format: JOURNAL_FORMAT,
            instances,
            reconciliation,
        };

        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            let line = serde_json::to_string(&record)?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *self.writer.lock() = BufWriter::new(file);

        info!(path = %self.path.display(), "Sequence journal compacted");
        Ok(())
    }

    fn append(&self, record: &JournalRecord) -> SequencerResult<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn apply_record(state: &mut StoreState, record: JournalRecord) -> SequencerResult<()> {
    match record {
        JournalRecord::Header { format } | JournalRecord::Snapshot { format, .. }
            if format != JOURNAL_FORMAT =>
        {
            Err(SequencerError::Store(format!(
                "unsupported journal format {format}, expected {JOURNAL_FORMAT}"
            )))
        }
        JournalRecord::Header { .. } => Ok(()),
        JournalRecord::Snapshot {
            instances,
            reconciliation,
            ..
        } => {
            state.restore(instances, reconciliation);
            Ok(())
        }
        JournalRecord::InstanceCreated { instance } => state.create_instance(instance),
        JournalRecord::SendAttempted {
            instance_id,
            step_index,
            at,
        } => state.mark_send_attempted(instance_id, step_index, at),
        JournalRecord::StepSent {
            instance_id,
            step_index,
            sent_at,
            last_step,
        } => state
            .record_sent(instance_id, step_index, sent_at, last_step)
            .map(|_| ()),
        JournalRecord::StepRetryScheduled {
            instance_id,
            step_index,
            error,
            next_attempt_at,
            at,
        } => state
            .record_retry(instance_id, step_index, &error, next_attempt_at, at)
            .map(|_| ()),
        JournalRecord::StepFailed {
            instance_id,
            step_index,
            error,
            at,
        } => state.record_failed(instance_id, step_index, &error, at),
        JournalRecord::StepSkipped {
            instance_id,
            step_index,
            reason,
            at,
        } => state.skip_step(instance_id, step_index, &reason, at),
        JournalRecord::InstanceCancelled {
            instance_id,
            reason,
            at,
        } => state.cancel_instance(instance_id, &reason, at).map(|_| ()),
        JournalRecord::ReconciliationQueued { entries } => {
            for entry in entries {
                state.push_reconciliation(entry);
            }
            Ok(())
        }
    }
}

impl SequenceStore for JournalStore {
    fn create_instance(&self, instance: SequenceInstance) -> SequencerResult<()> {
        let mut state = self.state.write();
        state.create_instance(instance.clone())?;
        self.append(&JournalRecord::InstanceCreated { instance })
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
        let mut state = self.state.write();
        state.mark_send_attempted(instance_id, step_index, at)?;
        self.append(&JournalRecord::SendAttempted {
            instance_id,
            step_index,
            at,
        })
    }

    fn record_sent(
        &self,
        instance_id: Uuid,
        step_index: u32,
        sent_at: DateTime<Utc>,
        last_step: bool,
    ) -> SequencerResult<bool> {
        let mut state = self.state.write();
        let completed = state.record_sent(instance_id, step_index, sent_at, last_step)?;
        self.append(&JournalRecord::StepSent {
            instance_id,
            step_index,
            sent_at,
            last_step,
        })?;
        Ok(completed)
    }

    fn record_retry(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> SequencerResult<u32> {
        let mut state = self.state.write();
        let attempts = state.record_retry(instance_id, step_index, error, next_attempt_at, at)?;
        self.append(&JournalRecord::StepRetryScheduled {
            instance_id,
            step_index,
            error: error.to_string(),
            next_attempt_at,
            at,
        })?;
        Ok(attempts)
    }

    fn record_failed(
        &self,
        instance_id: Uuid,
        step_index: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let mut state = self.state.write();
        state.record_failed(instance_id, step_index, error, at)?;
        self.append(&JournalRecord::StepFailed {
            instance_id,
            step_index,
            error: error.to_string(),
            at,
        })
    }

    fn skip_step(
        &self,
        instance_id: Uuid,
        step_index: u32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let mut state = self.state.write();
        state.skip_step(instance_id, step_index, reason, at)?;
        self.append(&JournalRecord::StepSkipped {
            instance_id,
            step_index,
            reason: reason.to_string(),
            at,
        })
    }

    fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<Option<SequenceInstance>> {
        let mut state = self.state.write();
        let cancelled = state.cancel_instance(instance_id, reason, at)?;
        if cancelled.is_some() {
            self.append(&JournalRecord::InstanceCancelled {
                instance_id,
                reason: reason.to_string(),
                at,
            })?;
        }
        Ok(cancelled)
    }

    fn reconciliation_queue(&self) -> Vec<ReconciliationEntry> {
        self.state.read().reconciliation_queue()
    }

    fn instance_count(&self) -> usize {
        self.state.read().instance_count()
    }
}
