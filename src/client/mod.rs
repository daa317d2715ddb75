//! Inference client module.
//!
//! The pipeline talks to the hosted model only through [`CompletionBackend`];
//! [`LlmClient`] is the HTTP implementation for OpenAI-compatible endpoints.

mod backend;
mod llm_client;
mod rate_limiter;
mod sse;

pub use backend::*;
pub use llm_client::*;
pub use rate_limiter::*;
pub use sse::*;
