//! Trace validation: format check, then answer check.
//!
//! Epistemic foundation:
//! - K_i: A verdict is a pure function of the trace text and the ground truth
//! - K_i: Format failures short-circuit; the answer is never looked at
//! - B_i: The answer can be extracted → `INCORRECT_ANSWER` otherwise, not an error

use super::equivalence::is_equivalent;
use super::extract::{extract_answer, gold_answer};
use super::format::check_format;
use crate::models::{FilteredReason, Generation, ReasoningTrace, Verdict};
use std::sync::Arc;

/// Answer extraction and comparison capability.
pub trait AnswerChecker: Send + Sync {
    /// Pull the final answer out of a model trace.
    fn extract(&self, text: &str) -> Option<String>;

    /// Whether an extracted answer matches the ground truth.
    fn equivalent(&self, extracted: &str, gold: &str) -> bool;
}

/// Built-in checker for math answers written in LaTeX.
#[derive(Debug, Clone, Copy, Default)]
pub struct MathChecker;

impl AnswerChecker for MathChecker {
    fn extract(&self, text: &str) -> Option<String> {
        extract_answer(text)
    }

    fn equivalent(&self, extracted: &str, gold: &str) -> bool {
        is_equivalent(extracted, &gold_answer(gold))
    }
}

/// Judges accumulated traces.
#[derive(Clone)]
pub struct TraceValidator {
    checker: Arc<dyn AnswerChecker>,
}

impl Default for TraceValidator {
    fn default() -> Self {
        Self::new(Arc::new(MathChecker))
    }
}

impl TraceValidator {
    pub fn new(checker: Arc<dyn AnswerChecker>) -> Self {
        Self { checker }
    }

    /// Verdict for `text` against the ground truth `gold`.
    pub fn validate(&self, text: &str, gold: &str) -> Verdict {
        if !check_format(text) {
            return Verdict::new(FilteredReason::InvalidFormat, None);
        }

        let Some(extracted) = self.checker.extract(text) else {
            return Verdict::new(FilteredReason::IncorrectAnswer, None);
        };

        let reason = if !gold.trim().is_empty() && self.checker.equivalent(&extracted, gold) {
            FilteredReason::Valid
        } else {
            FilteredReason::IncorrectAnswer
        };
        Verdict::new(reason, Some(extracted))
    }

    /// Turn a generation into a persisted trace.
    pub fn judge(&self, generation: Generation) -> ReasoningTrace {
        let verdict = self.validate(&generation.text, &generation.record.answer);
        ReasoningTrace::from_generation(generation, verdict)
    }

    /// Recompute the verdict of a trace read back from disk.
    pub fn revalidate(&self, trace: &mut ReasoningTrace) {
        let verdict = self.validate(&trace.reasoning_trace, &trace.record.answer);
        trace.apply_verdict(verdict);
    }
}
