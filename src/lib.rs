//! tracedistill - Reasoning-trace distillation from a hosted reasoning model.
//!
//! ## Architecture
//!
//! A linear pipeline with a bounded worker pool:
//! - **Dataset Source**: corpus + split → ordered problem/answer records
//! - **Trace Requester**: one streamed chat completion per record and sample
//! - **Stream Accumulator**: `Idle → Streaming → {Complete | Truncated}`
//! - **Trace Validator**: `<think>` format check, then answer equivalence
//!
//! Every trace is written to the intermediate dataset with its verdict;
//! a separate filter step produces the final dataset.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/stream uncertainties (retry, backoff, truncation)

pub mod checkpoint;
pub mod client;
pub mod dataset;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod stream;
pub mod verify;

// Re-exports for convenience
pub use checkpoint::{CheckpointManager, CheckpointState};
pub use client::{CompletionBackend, LlmClient, RateLimiter};
pub use dataset::{DatasetSource, JsonlCorpus};
pub use models::{
    Config, DistillError, FilteredReason, ProblemRecord, ReasoningTrace, Result, RunStats,
    StreamStatus,
};
pub use pipeline::{filter_dataset, revalidate_dataset, DistillPipeline};
pub use pool::{TraceRequester, WorkerPool};
pub use verify::TraceValidator;
