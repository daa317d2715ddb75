//! Stream accumulation.
//!
//! Epistemic foundation:
//! - K_i: Fragments are appended in arrival order; none are dropped or reordered
//! - K_i: A stream ends exactly once, either complete or truncated
//! - I^B: The transport may fail at any point → keep what arrived, mark truncated

mod accumulator;

pub use accumulator::*;
