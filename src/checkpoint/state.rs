//! Checkpoint state for resumable distillation runs.
//!
//! Epistemic foundation:
//! - K_i: A record is done once every one of its samples is written out
//! - K_i: State is persisted to disk atomically (write-then-rename)
//! - B_i: Checkpoint file may not exist → fresh state
//! - I^B: Crash during write → backup file provides recovery

use crate::models::{DistillError, FilteredReason, ReasoningTrace, Result, RunStats, StreamStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Status of a record in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Not yet written
    Pending,
    /// All samples written
    Done,
}

/// Checkpoint entry for a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCheckpoint {
    pub status: RecordStatus,
    /// Samples of this record that came out VALID
    #[serde(default)]
    pub valid_samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Counters kept alongside the per-record statuses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub pending: usize,
    pub done: usize,
    pub valid: usize,
    pub invalid_format: usize,
    pub incorrect_answer: usize,
    pub truncated: usize,
}

/// Checkpoint state for one output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub corpus: String,
    pub split: String,
    pub samples_per_problem: usize,
    pub total_records: usize,
    /// Indexed by record position in the loaded corpus
    pub records: Vec<RecordCheckpoint>,
    pub stats: CheckpointStats,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(corpus: &str, split: &str, total_records: usize, samples_per_problem: usize) -> Self {
        let now = Utc::now();
        Self {
            corpus: corpus.to_string(),
            split: split.to_string(),
            samples_per_problem,
            total_records,
            records: vec![
                RecordCheckpoint {
                    status: RecordStatus::Pending,
                    valid_samples: 0,
                    updated_at: None,
                };
                total_records
            ],
            stats: CheckpointStats {
                pending: total_records,
                ..Default::default()
            },
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether this checkpoint was written for the same run shape.
    pub fn matches(&self, corpus: &str, split: &str, total_records: usize, samples_per_problem: usize) -> bool {
        self.corpus == corpus
            && self.split == split
            && self.total_records == total_records
            && self.samples_per_problem == samples_per_problem
            && self.records.len() == total_records
    }

    /// Record indices still to process, ascending.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, cp)| cp.status == RecordStatus::Pending)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Mark a record done and count its traces. A record is only counted once.
    pub fn mark_done(&mut self, record_index: usize, traces: &[&ReasoningTrace]) {
        let Some(cp) = self.records.get_mut(record_index) else {
            warn!(record_index, "Checkpoint has no such record");
            return;
        };
        if cp.status == RecordStatus::Done {
            return;
        }

        cp.status = RecordStatus::Done;
        cp.valid_samples = traces
            .iter()
            .filter(|t| t.filtered_reason == FilteredReason::Valid)
            .count();
        cp.updated_at = Some(Utc::now());

        self.stats.pending = self.stats.pending.saturating_sub(1);
        self.stats.done += 1;
        for trace in traces {
            match trace.filtered_reason {
                FilteredReason::Valid => self.stats.valid += 1,
                FilteredReason::InvalidFormat => self.stats.invalid_format += 1,
                FilteredReason::IncorrectAnswer => self.stats.incorrect_answer += 1,
            }
            if trace.stream_status == StreamStatus::Truncated {
                self.stats.truncated += 1;
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.stats.pending == 0
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_records == 0 {
            return 100.0;
        }
        (self.stats.done as f64 / self.total_records as f64) * 100.0
    }

    /// Whole-run statistics, resumed sessions included.
    pub fn to_run_stats(&self, runtime_secs: f64) -> RunStats {
        let mut stats = RunStats {
            total_records: self.total_records,
            total_traces: self.stats.valid + self.stats.invalid_format + self.stats.incorrect_answer,
            valid: self.stats.valid,
            invalid_format: self.stats.invalid_format,
            incorrect_answer: self.stats.incorrect_answer,
            truncated: self.stats.truncated,
            runtime_secs,
            ..Default::default()
        };
        stats.finalize();
        stats
    }
}

/// Persists a [`CheckpointState`] next to one output file.
pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
    state: Option<CheckpointState>,
}

impl CheckpointManager {
    /// Create a manager for checkpoint `name` inside `dir`.
    pub fn new(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| DistillError::io("creating checkpoint dir", e))?;

        Ok(Self {
            checkpoint_path: dir.join(format!("{name}.checkpoint.json")),
            backup_path: dir.join(format!("{name}.checkpoint.backup.json")),
            temp_path: dir.join(format!("{name}.checkpoint.tmp.json")),
            state: None,
        })
    }

    /// Checkpoint named after an output file's stem.
    pub fn for_output(dir: &Path, output: &Path) -> Result<Self> {
        let name = output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("traces");
        Self::new(dir, name)
    }

    pub fn exists(&self) -> bool {
        self.checkpoint_path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Load the existing checkpoint, or start a fresh one.
    ///
    /// A checkpoint written for a different corpus, split, record count or
    /// sample count is rejected rather than silently reused.
    pub fn init_or_load(
        &mut self,
        corpus: &str,
        split: &str,
        total_records: usize,
        samples_per_problem: usize,
    ) -> Result<&CheckpointState> {
        let state = if self.exists() {
            let state = self.read()?;
            if !state.matches(corpus, split, total_records, samples_per_problem) {
                return Err(DistillError::InvalidInput(format!(
                    "checkpoint {} belongs to a different run ({}/{} with {} records × {} samples)",
                    self.checkpoint_path.display(),
                    state.corpus,
                    state.split,
                    state.total_records,
                    state.samples_per_problem
                )));
            }
            info!(
                pending = state.stats.pending,
                done = state.stats.done,
                valid = state.stats.valid,
                "Resuming from checkpoint"
            );
            state
        } else {
            info!(total = total_records, "Created new checkpoint");
            CheckpointState::new(corpus, split, total_records, samples_per_problem)
        };

        self.state = Some(state);
        self.save()?;
        self.state
            .as_ref()
            .ok_or_else(|| DistillError::Internal("checkpoint state missing after init".to_string()))
    }

    fn read(&self) -> Result<CheckpointState> {
        let file = File::open(&self.checkpoint_path)
            .map_err(|e| DistillError::io("opening checkpoint", e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| DistillError::ParseError(format!("Invalid checkpoint: {e}")))
    }

    /// Save checkpoint to disk (backup, temp write, rename).
    pub fn save(&self) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| DistillError::Internal("No checkpoint state to save".to_string()))?;

        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| DistillError::io("backing up checkpoint", e))?;
        }

        let file = File::create(&self.temp_path)
            .map_err(|e| DistillError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)
            .map_err(|e| DistillError::Internal(format!("Serializing checkpoint: {e}")))?;
        // A failed flush must not replace the good checkpoint
        writer
            .flush()
            .map_err(|e| DistillError::io("writing temp checkpoint", e))?;

        fs::rename(&self.temp_path, &self.checkpoint_path)
            .map_err(|e| DistillError::io("renaming checkpoint", e))?;

        debug!(path = %self.checkpoint_path.display(), "Checkpoint saved");
        Ok(())
    }

    pub fn state(&self) -> Option<&CheckpointState> {
        self.state.as_ref()
    }

    /// Mark a set of records done and save once.
    pub fn mark_done_batch<'a, I>(&mut self, finished: I) -> Result<()>
    where
        I: IntoIterator<Item = (usize, Vec<&'a ReasoningTrace>)>,
    {
        if let Some(state) = &mut self.state {
            for (record_index, traces) in finished {
                state.mark_done(record_index, &traces);
            }
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Generation, ProblemRecord, Verdict};
    use tempfile::TempDir;

    fn trace(reason: FilteredReason, status: StreamStatus) -> ReasoningTrace {
        ReasoningTrace::from_generation(
            Generation {
                record_index: 0,
                sample_index: 0,
                record: ProblemRecord::new("p", "1"),
                text: String::new(),
                status,
                stream_error: None,
                model: "m".to_string(),
                generated_at: Utc::now(),
                generation_time_ms: 0,
            },
            Verdict::new(reason, None),
        )
    }

    #[test]
    fn test_mark_done_counts_once() {
        let mut state = CheckpointState::new("math", "train", 3, 2);
        let ok = trace(FilteredReason::Valid, StreamStatus::Complete);
        let cut = trace(FilteredReason::InvalidFormat, StreamStatus::Truncated);

        state.mark_done(1, &[&ok, &cut]);
        state.mark_done(1, &[&ok, &cut]);

        assert_eq!(state.pending_indices(), vec![0, 2]);
        assert_eq!(state.stats.done, 1);
        assert_eq!(state.stats.valid, 1);
        assert_eq!(state.stats.invalid_format, 1);
        assert_eq!(state.stats.truncated, 1);
        assert_eq!(state.records[1].valid_samples, 1);
        assert!(!state.is_complete());

        let stats = state.to_run_stats(10.0);
        assert_eq!(stats.total_traces, 2);
        assert!((stats.acceptance_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_save_and_resume() {
        let dir = TempDir::new().unwrap();
        let ok = trace(FilteredReason::Valid, StreamStatus::Complete);

        let mut manager = CheckpointManager::new(dir.path(), "traces").unwrap();
        manager.init_or_load("math", "train", 2, 1).unwrap();
        manager.mark_done_batch(vec![(0, vec![&ok])]).unwrap();
        manager.save().unwrap();
        assert!(dir.path().join("traces.checkpoint.backup.json").exists());

        let mut resumed = CheckpointManager::new(dir.path(), "traces").unwrap();
        let state = resumed.init_or_load("math", "train", 2, 1).unwrap();
        assert_eq!(state.pending_indices(), vec![1]);
        assert_eq!(state.records[0].status, RecordStatus::Done);
        assert_eq!(state.stats.valid, 1);
    }

    #[test]
    fn test_mismatched_checkpoint_rejected() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), "traces").unwrap();
        manager.init_or_load("math", "train", 2, 1).unwrap();

        let mut other = CheckpointManager::new(dir.path(), "traces").unwrap();
        let err = other.init_or_load("math", "test", 2, 1).unwrap_err();
        assert!(matches!(err, DistillError::InvalidInput(_)));
    }

    #[test]
    fn test_checkpoint_named_after_output_stem() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::for_output(dir.path(), Path::new("out/run1.jsonl")).unwrap();
        manager.init_or_load("c", "s", 1, 1).unwrap();
        assert!(dir.path().join("run1.checkpoint.json").exists());
        assert!(!dir.path().join("run1.checkpoint.tmp.json").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_write_keeps_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let ok = trace(FilteredReason::Valid, StreamStatus::Complete);

        let mut manager = CheckpointManager::new(dir.path(), "traces").unwrap();
        manager.init_or_load("math", "train", 2, 1).unwrap();
        let before = fs::read_to_string(manager.path()).unwrap();

        // Writes to /dev/full only fail once the buffer is flushed
        manager.temp_path = PathBuf::from("/dev/full");
        let err = manager.mark_done_batch(vec![(0, vec![&ok])]).unwrap_err();
        assert!(matches!(err, DistillError::Io { .. }));
        assert_eq!(fs::read_to_string(manager.path()).unwrap(), before);
    }
}
