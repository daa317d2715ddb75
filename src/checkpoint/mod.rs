//! Checkpoint module for resumable distillation runs.
//!
//! Provides:
//! - `CheckpointState`: per-record status and verdict counters
//! - `CheckpointManager`: atomic persistence with a backup copy

mod state;

pub use state::*;
