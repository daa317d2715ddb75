//! Generation pool: request construction and bounded concurrent streaming.

mod requester;
mod worker;

pub use requester::*;
pub use worker::*;
