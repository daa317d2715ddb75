//! Transport-agnostic completion interface.
//!
//! Epistemic foundation:
//! - K_i: The model is a remote capability: submit a prompt, get text fragments back
//! - K_i: Fragments arrive in order; the stream ends or fails, nothing else
//! - B_i: Opening the stream may fail → Result
//! - B_i: Each fragment may be a transport failure instead → Result per item

use crate::models::{ModelSpec, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Ordered text fragments from a streamed completion.
///
/// An `Err` item means the transport broke; no items follow it.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Decoding parameters sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.7,
            max_tokens: 32768,
        }
    }
}

impl From<&ModelSpec> for DecodingParams {
    fn from(spec: &ModelSpec) -> Self {
        Self {
            temperature: spec.temperature,
            top_p: spec.top_p,
            max_tokens: spec.max_tokens,
        }
    }
}

/// A fully-specified streamed completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub params: DecodingParams,
}

/// Something that turns a request into a stream of text fragments.
///
/// `submit` resolves once the stream is open; it does not wait for the
/// stream to be consumed.
pub trait CompletionBackend: Send + Sync {
    fn submit<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<TextStream>>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "backend"
    }
}
