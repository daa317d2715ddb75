//! Trace requester: one user-turn prompt per record, streamed back.
//!
//! Epistemic foundation:
//! - K_i: R1-style reasoning models take no system prompt; all instructions live in the user turn
//! - K_i: Decoding parameters are fixed for the whole run
//! - B_i: The endpoint opens the stream (might fail) → Result
//! - I^R: Prompt template and model are configurable

use crate::client::{CompletionBackend, CompletionRequest, DecodingParams, Message, TextStream};
use crate::models::{Config, DistillError, ProblemRecord, Result, PROBLEM_PLACEHOLDER};
use std::sync::Arc;

/// Builds and submits completion requests.
pub struct TraceRequester {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    params: DecodingParams,
    template: String,
}

impl TraceRequester {
    /// Create a requester. The template must contain `{problem}`.
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        params: DecodingParams,
        template: impl Into<String>,
    ) -> Result<Self> {
        let template = template.into();
        if !template.contains(PROBLEM_PLACEHOLDER) {
            return Err(DistillError::InvalidInput(format!(
                "prompt template has no {PROBLEM_PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self {
            backend,
            model: model.into(),
            params,
            template,
        })
    }

    pub fn from_config(backend: Arc<dyn CompletionBackend>, config: &Config) -> Result<Self> {
        Self::new(
            backend,
            config.model.id.clone(),
            DecodingParams::from(&config.model),
            config.generation.prompt_template.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// The user-turn text for a problem.
    pub fn render_prompt(&self, problem: &str) -> String {
        self.template.replace(PROBLEM_PLACEHOLDER, problem)
    }

    /// A single user message; never a system message.
    pub fn build_request(&self, record: &ProblemRecord) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user(self.render_prompt(&record.problem))],
            params: self.params,
        }
    }

    /// Open the stream for one record without consuming it.
    pub async fn request(&self, record: &ProblemRecord) -> Result<TextStream> {
        let request = self.build_request(record);
        self.backend.submit(&request).await
    }
}
