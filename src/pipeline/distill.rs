//! Distillation pipeline.
//!
//! Pipeline flow:
//! Records → Worker Pool → Stream Accumulator → Trace Validator → JSONL (every trace, with reason)
//!
//! Epistemic foundation:
//! - K_i: Every (record, sample) pair yields exactly one output row
//! - K_i: Rows are written in record order, batch by batch, and flushed per batch
//! - B_i: A previous run may have been interrupted → checkpoint + existing rows are reconciled
//! - I^R: Batch size follows the worker pool size

use crate::checkpoint::CheckpointManager;
use crate::client::CompletionBackend;
use crate::dataset::DatasetSource;
use crate::models::{Config, DistillError, ProblemRecord, ReasoningTrace, Result, RunStats};
use crate::pool::{GenerationJob, TraceRequester, WorkerPool};
use crate::verify::TraceValidator;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Traces already present in the output file, keyed by record index.
type ExistingTraces = HashMap<usize, Vec<ReasoningTrace>>;

/// Generates, validates and writes reasoning traces.
pub struct DistillPipeline {
    pool: WorkerPool,
    validator: TraceValidator,
    samples_per_problem: usize,
    show_progress: bool,
}

impl DistillPipeline {
    pub fn new(pool: WorkerPool, validator: TraceValidator, samples_per_problem: usize) -> Self {
        Self {
            pool,
            validator,
            samples_per_problem: samples_per_problem.max(1),
            show_progress: true,
        }
    }

    /// Create a pipeline from configuration.
    pub fn from_config(backend: Arc<dyn CompletionBackend>, config: &Config) -> Result<Self> {
        let requester = TraceRequester::from_config(backend, config)?;
        let pool = WorkerPool::new(Arc::new(requester), config.workers.size).with_record_timeout(
            config
                .workers
                .record_timeout_secs
                .map(Duration::from_secs),
        );

        Ok(Self::new(
            pool,
            TraceValidator::default(),
            config.generation.samples_per_problem,
        ))
    }

    /// Sample count per record (overrides the config value).
    pub fn with_samples(mut self, samples_per_problem: usize) -> Self {
        self.samples_per_problem = samples_per_problem.max(1);
        self
    }

    /// Draw a progress bar on stderr while running.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn batch_size(&self) -> usize {
        (self.pool.pool_size() * 2).max(10)
    }

    /// Load `split` of `corpus` and distill it into `output_path`.
    pub async fn distill(
        &self,
        source: &dyn DatasetSource,
        corpus: &str,
        split: &str,
        output_path: &Path,
        checkpoint: Option<CheckpointManager>,
    ) -> Result<RunStats> {
        let records = source.load(corpus, split)?;
        match checkpoint {
            Some(checkpoint) => {
                self.run_with_checkpoint(corpus, split, &records, output_path, checkpoint)
                    .await
            }
            None => self.run(&records, output_path).await,
        }
    }

    /// Run over every record, replacing any existing output file.
    pub async fn run(&self, records: &[ProblemRecord], output_path: &Path) -> Result<RunStats> {
        let start = Instant::now();
        let total = records.len();

        info!(
            total_records = total,
            samples = self.samples_per_problem,
            workers = self.pool.pool_size(),
            model = %self.pool.model(),
            "Starting distillation"
        );

        let output_file =
            File::create(output_path).map_err(|e| DistillError::io("creating output file", e))?;
        let mut writer = BufWriter::new(output_file);

        let pb = self.progress_bar(total, 0);
        let pending: Vec<usize> = (0..total).collect();
        let mut stats = self
            .process(records, &pending, &mut writer, None, &HashMap::new(), &pb)
            .await?;

        stats.total_records = total;
        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        pb.finish_with_message(format!(
            "Done! {} valid, {} filtered",
            stats.valid,
            stats.total_traces - stats.valid
        ));
        log_summary(&stats);
        Ok(stats)
    }

    /// Run with resume support. Only pending records are processed and the
    /// output file is appended to when the checkpoint already existed.
    ///
    /// Returns whole-run statistics, earlier sessions included.
    pub async fn run_with_checkpoint(
        &self,
        corpus: &str,
        split: &str,
        records: &[ProblemRecord],
        output_path: &Path,
        mut checkpoint: CheckpointManager,
    ) -> Result<RunStats> {
        let start = Instant::now();
        let total = records.len();
        let resuming = checkpoint.exists();

        let state = checkpoint.init_or_load(corpus, split, total, self.samples_per_problem)?;
        let pending = state.pending_indices();
        let progress = format!("{:.1}%", state.progress_percent());

        if state.is_complete() {
            info!("All records already processed, nothing to do");
            return Ok(finished_stats(&checkpoint, 0.0));
        }

        let (existing, needs_newline) = if resuming && output_path.exists() {
            existing_traces(output_path, &pending)?
        } else {
            (HashMap::new(), false)
        };

        let already_done = total - pending.len();
        info!(
            total_records = total,
            pending = pending.len(),
            already_done,
            progress = %progress,
            reconciled_rows = existing.values().map(Vec::len).sum::<usize>(),
            workers = self.pool.pool_size(),
            "Resuming distillation"
        );

        let output_file = if resuming {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(output_path)
                .map_err(|e| DistillError::io("opening output file", e))?
        } else {
            File::create(output_path).map_err(|e| DistillError::io("creating output file", e))?
        };
        let mut writer = BufWriter::new(output_file);

        // Terminate a row cut off by the previous crash
        if needs_newline {
            writeln!(writer).map_err(|e| DistillError::io("writing output", e))?;
        }

        let pb = self.progress_bar(total, already_done);
        let session = self
            .process(
                records,
                &pending,
                &mut writer,
                Some(&mut checkpoint),
                &existing,
                &pb,
            )
            .await?;

        pb.finish_with_message(format!(
            "Done! {} valid, {} filtered this session",
            session.valid,
            session.total_traces - session.valid
        ));

        let stats = finished_stats(&checkpoint, start.elapsed().as_secs_f64());
        log_summary(&stats);
        Ok(stats)
    }

    /// Generate, validate and write the pending records batch by batch.
    async fn process<W: Write>(
        &self,
        records: &[ProblemRecord],
        pending: &[usize],
        writer: &mut W,
        mut checkpoint: Option<&mut CheckpointManager>,
        existing: &ExistingTraces,
        pb: &ProgressBar,
    ) -> Result<RunStats> {
        let mut stats = RunStats::default();

        for chunk in pending.chunks(self.batch_size()) {
            let jobs = self.jobs_for(records, chunk, existing);
            let generations = self.pool.generate_batch(jobs).await;

            let traces: Vec<ReasoningTrace> = generations
                .into_iter()
                .map(|generation| self.validator.judge(generation))
                .collect();

            for trace in &traces {
                let json = serde_json::to_string(trace).map_err(|e| {
                    DistillError::Internal(format!("Failed to serialize trace: {e}"))
                })?;
                writeln!(writer, "{json}").map_err(|e| DistillError::io("writing output", e))?;
                stats.record(trace);
            }

            // Rows must be on disk before the checkpoint says so
            writer
                .flush()
                .map_err(|e| DistillError::io("flushing output", e))?;

            if let Some(checkpoint) = checkpoint.as_deref_mut() {
                let mut finished: BTreeMap<usize, Vec<&ReasoningTrace>> = chunk
                    .iter()
                    .map(|&idx| {
                        let prior = existing
                            .get(&idx)
                            .map(|rows| rows.iter().collect())
                            .unwrap_or_default();
                        (idx, prior)
                    })
                    .collect();
                for trace in &traces {
                    finished.entry(trace.record_index).or_default().push(trace);
                }
                checkpoint.mark_done_batch(finished)?;
            }

            pb.inc(chunk.len() as u64);
            pb.set_message(format!(
                "valid: {}, filtered: {}",
                stats.valid,
                stats.total_traces - stats.valid
            ));
        }

        Ok(stats)
    }

    /// One job per missing (record, sample) pair.
    fn jobs_for(
        &self,
        records: &[ProblemRecord],
        chunk: &[usize],
        existing: &ExistingTraces,
    ) -> Vec<GenerationJob> {
        let mut jobs = Vec::with_capacity(chunk.len() * self.samples_per_problem);

        for &record_index in chunk {
            let Some(record) = records.get(record_index) else {
                warn!(record_index, "Checkpoint refers to a record outside the corpus");
                continue;
            };
            let written: HashSet<usize> = existing
                .get(&record_index)
                .map(|rows| rows.iter().map(|t| t.sample_index).collect())
                .unwrap_or_default();

            for sample_index in 0..self.samples_per_problem {
                if written.contains(&sample_index) {
                    continue;
                }
                jobs.push(GenerationJob {
                    record_index,
                    sample_index,
                    record: record.clone(),
                });
            }
        }

        jobs
    }

    fn progress_bar(&self, total: usize, done: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_position(done as u64);
        pb
    }
}

fn finished_stats(checkpoint: &CheckpointManager, runtime_secs: f64) -> RunStats {
    checkpoint
        .state()
        .map(|state| state.to_run_stats(runtime_secs))
        .unwrap_or_default()
}

fn log_summary(stats: &RunStats) {
    info!(
        records = stats.total_records,
        traces = stats.total_traces,
        valid = stats.valid,
        invalid_format = stats.invalid_format,
        incorrect_answer = stats.incorrect_answer,
        truncated = stats.truncated,
        acceptance_rate = format!("{:.1}%", stats.acceptance_rate * 100.0),
        throughput = format!("{:.0}/hr", stats.throughput_per_hour),
        "Distillation complete"
    );
}

/// Rows of pending records already written by an interrupted run.
///
/// Lines that do not parse (typically one cut off mid-write) are skipped.
/// The flag reports whether the file ends without a newline.
fn existing_traces(path: &Path, pending: &[usize]) -> Result<(ExistingTraces, bool)> {
    let content =
        std::fs::read_to_string(path).map_err(|e| DistillError::io("reading output file", e))?;
    let pending: HashSet<usize> = pending.iter().copied().collect();
    let mut existing = ExistingTraces::new();

    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReasoningTrace>(line) {
            Ok(trace) if pending.contains(&trace.record_index) => {
                existing.entry(trace.record_index).or_default().push(trace);
            }
            Ok(_) => {}
            Err(e) => warn!(line = line_num + 1, error = %e, "Skipping unreadable output row"),
        }
    }

    let needs_newline = !content.is_empty() && !content.ends_with('\n');
    Ok((existing, needs_newline))
}
