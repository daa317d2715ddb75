//! Explicit state machine that turns a fragment stream into one trace text.

use crate::client::TextStream;
use crate::models::StreamStatus;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Accumulator state.
///
/// `Idle → Streaming → {Complete | Truncated}`; `Idle` may also end directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing received yet
    Idle,
    /// At least one fragment received, end not seen
    Streaming,
    /// End-of-message seen
    Complete,
    /// Transport failed before end-of-message
    Truncated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Truncated)
    }
}

/// Final output of an accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulated {
    /// Concatenation of every accepted fragment
    pub text: String,
    pub status: StreamStatus,
    /// Number of fragments accepted
    pub fragments: usize,
    /// Failure message when truncated
    pub failure: Option<String>,
}

impl Accumulated {
    /// A stream that never opened: empty and truncated.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            status: StreamStatus::Truncated,
            fragments: 0,
            failure: Some(reason.into()),
        }
    }
}

/// Collects fragments for one record.
#[derive(Debug)]
pub struct StreamAccumulator {
    state: StreamState,
    text: String,
    fragments: usize,
    failure: Option<String>,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            text: String::new(),
            fragments: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Append a fragment. Ignored once terminal; returns whether it was taken.
    pub fn on_fragment(&mut self, fragment: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.text.push_str(fragment);
        self.fragments += 1;
        self.state = StreamState::Streaming;
        true
    }

    /// End-of-message.
    pub fn on_end(&mut self) {
        if !self.state.is_terminal() {
            self.state = StreamState::Complete;
        }
    }

    /// Transport failure. The partial text is kept.
    pub fn on_failure(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = StreamState::Truncated;
            self.failure = Some(reason.into());
        }
    }

    /// Consume the accumulator. A non-terminal accumulator counts as truncated.
    pub fn finish(mut self) -> Accumulated {
        if !self.state.is_terminal() {
            self.on_failure("stream abandoned before it ended");
        }
        Accumulated {
            text: self.text,
            status: if self.state == StreamState::Complete {
                StreamStatus::Complete
            } else {
                StreamStatus::Truncated
            },
            fragments: self.fragments,
            failure: self.failure,
        }
    }
}

/// Drain `stream` into an [`Accumulated`].
///
/// Never fails: an `Err` item or an expired `deadline` both end the
/// accumulation as truncated, with everything received so far.
pub async fn accumulate(mut stream: TextStream, deadline: Option<Instant>) -> Accumulated {
    let mut acc = StreamAccumulator::new();

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    acc.on_failure("record deadline exceeded");
                    break;
                }
            },
            None => stream.next().await,
        };

        match next {
            Some(Ok(fragment)) => {
                acc.on_fragment(&fragment);
            }
            Some(Err(e)) => {
                acc.on_failure(e.to_string());
                break;
            }
            None => {
                acc.on_end();
                break;
            }
        }
    }

    let result = acc.finish();
    match &result.failure {
        Some(error) => warn!(
            partial_len = result.text.len(),
            fragments = result.fragments,
            error = %error,
            "Stream truncated, keeping partial trace"
        ),
        None => debug!(
            len = result.text.len(),
            fragments = result.fragments,
            "Stream complete"
        ),
    }
    result
}
