//! Pipeline module - distillation run and dataset post-processing.

mod distill;
mod filter;

pub use distill::*;
pub use filter::*;
