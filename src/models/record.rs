//! Record and trace types for tracedistill.
//!
//! K_i: These types represent the core data flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Field names owned by [`ReasoningTrace`]. Passthrough source fields with
/// one of these names are renamed on load so output rows never carry
/// duplicate keys.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "record_index",
    "sample_index",
    "problem",
    "answer",
    "reasoning_trace",
    "filtered",
    "filtered_reason",
    "stream_status",
    "stream_error",
    "extracted_answer",
    "model",
    "generated_at",
    "generation_time_ms",
];

/// One entry from the source corpus.
///
/// K_i: Immutable once loaded. Every other source field rides along in
/// `extra` and is written back out untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    /// Free-form question text
    pub problem: String,

    /// Ground-truth answer; empty when the source row had none
    #[serde(default)]
    pub answer: String,

    /// Remaining source fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProblemRecord {
    pub fn new(problem: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            answer: answer.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Why a trace was kept or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilteredReason {
    /// Well-formed and the answer matches
    Valid,
    /// Thinking delimiters missing, misplaced or repeated
    InvalidFormat,
    /// Answer missing, unparseable or not equivalent to the ground truth
    IncorrectAnswer,
}

impl FilteredReason {
    /// Whether a trace with this reason is excluded from the final dataset.
    pub fn is_filtered(self) -> bool {
        self != Self::Valid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "VALID",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::IncorrectAnswer => "INCORRECT_ANSWER",
        }
    }
}

impl std::fmt::Display for FilteredReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a streamed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// The endpoint signalled end-of-message
    Complete,
    /// The transport failed (or the deadline passed) before end-of-message
    Truncated,
}

/// Output of the validator for one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub reason: FilteredReason,
    /// Answer expression found in the trace, if extraction got that far
    pub extracted_answer: Option<String>,
}

impl Verdict {
    pub fn new(reason: FilteredReason, extracted_answer: Option<String>) -> Self {
        Self {
            reason,
            extracted_answer,
        }
    }

    pub fn filtered(&self) -> bool {
        self.reason.is_filtered()
    }
}

/// Accumulated model output for one record, before validation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Position of the source record in the loaded corpus
    pub record_index: usize,
    /// Sampling attempt for this record (0-based)
    pub sample_index: usize,
    /// Source record
    pub record: ProblemRecord,
    /// Everything received, in arrival order
    pub text: String,
    /// How the stream ended
    pub status: StreamStatus,
    /// Transport failure message when truncated
    pub stream_error: Option<String>,
    /// Model asked for the trace
    pub model: String,
    /// Generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Time spent requesting and streaming
    pub generation_time_ms: u64,
}

/// Persisted dataset row: the source record plus the trace and its verdict.
///
/// K_i: `filtered_reason == VALID` iff `filtered == false`. Traces are only
/// built from a [`Verdict`], which derives one field from the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTrace {
    /// Unique identifier for this trace
    pub id: Uuid,

    /// Position of the source record in the loaded corpus
    pub record_index: usize,

    /// Sampling attempt for this record (0-based)
    pub sample_index: usize,

    /// Source record fields (problem, answer, passthrough)
    #[serde(flatten)]
    pub record: ProblemRecord,

    /// Full text produced by the model
    pub reasoning_trace: String,

    /// True = excluded from the final dataset
    pub filtered: bool,

    /// Reason code for the verdict
    pub filtered_reason: FilteredReason,

    /// Whether the stream is known to be complete
    pub stream_status: StreamStatus,

    /// Transport failure message, when truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_error: Option<String>,

    /// Answer the validator extracted, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_answer: Option<String>,

    /// Model used for generation
    pub model: String,

    /// Generation timestamp
    pub generated_at: DateTime<Utc>,

    /// Generation time in milliseconds
    pub generation_time_ms: u64,
}

impl ReasoningTrace {
    /// Attach a verdict to an accumulated generation.
    pub fn from_generation(generation: Generation, verdict: Verdict) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_index: generation.record_index,
            sample_index: generation.sample_index,
            record: generation.record,
            reasoning_trace: generation.text,
            filtered: verdict.filtered(),
            filtered_reason: verdict.reason,
            stream_status: generation.status,
            stream_error: generation.stream_error,
            extracted_answer: verdict.extracted_answer,
            model: generation.model,
            generated_at: generation.generated_at,
            generation_time_ms: generation.generation_time_ms,
        }
    }

    /// Replace the verdict, keeping the invariant.
    pub fn apply_verdict(&mut self, verdict: Verdict) {
        self.filtered = verdict.filtered();
        self.filtered_reason = verdict.reason;
        self.extracted_answer = verdict.extracted_answer;
    }

    /// Check `filtered` against `filtered_reason`. Only rows read back from
    /// disk can fail this.
    pub fn is_consistent(&self) -> bool {
        self.filtered == self.filtered_reason.is_filtered()
    }
}

/// Statistics for a distillation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Records loaded
    pub total_records: usize,

    /// Traces produced (records × samples)
    pub total_traces: usize,

    /// Traces kept
    pub valid: usize,

    /// Traces discarded for format
    pub invalid_format: usize,

    /// Traces discarded for answer
    pub incorrect_answer: usize,

    /// Traces whose stream did not complete
    pub truncated: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Valid traces per hour
    pub throughput_per_hour: f64,

    /// Valid / total traces (0.0 - 1.0)
    pub acceptance_rate: f64,
}

impl RunStats {
    /// Count one finished trace.
    pub fn record(&mut self, trace: &ReasoningTrace) {
        self.total_traces += 1;
        match trace.filtered_reason {
            FilteredReason::Valid => self.valid += 1,
            FilteredReason::InvalidFormat => self.invalid_format += 1,
            FilteredReason::IncorrectAnswer => self.incorrect_answer += 1,
        }
        if trace.stream_status == StreamStatus::Truncated {
            self.truncated += 1;
        }
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.total_traces > 0 {
            self.acceptance_rate = self.valid as f64 / self.total_traces as f64;
        }
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.valid as f64 / self.runtime_secs * 3600.0;
        }
    }
}
