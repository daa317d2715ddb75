//! Trace verification.
//!
//! Epistemic foundation:
//! - K_i: A usable trace opens with exactly one `<think>…</think>` section
//! - K_i: The boxed answer is the model's definitive output
//! - B_i: Equal answers may be written differently → normalize, then compare values
//!
//! Everything here is synchronous and side-effect free.

mod equivalence;
mod expr;
mod extract;
mod format;
mod normalize;
mod validator;

pub use equivalence::{is_equivalent, RELATIVE_TOLERANCE};
pub use expr::{Expr, Func};
pub use extract::{extract_answer, gold_answer, last_boxed};
pub use format::{after_think, check_format, THINK_CLOSE, THINK_OPEN};
pub use normalize::{compact, normalize};
pub use validator::{AnswerChecker, MathChecker, TraceValidator};
