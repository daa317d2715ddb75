//! Server-sent event decoding for streamed chat completions.
//!
//! Epistemic foundation:
//! - K_i: Events are `data:` lines terminated by a blank line
//! - K_i: `data: [DONE]` (or a `finish_reason`) marks end-of-message
//! - B_i: Chunk boundaries are arbitrary, even inside a UTF-8 sequence
//! - I^B: The peer may close early or send an in-band error → transport failure

use crate::client::TextStream;
use crate::models::{DistillError, Result};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::debug;

/// One streamed chunk (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A text fragment
    Delta(String),
    /// The model stopped; carries the finish reason
    Finished(String),
    /// The `[DONE]` terminator
    Done,
    /// In-band error or undecodable chunk
    Error(String),
}

/// Incremental SSE decoder; feed it raw body chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a body chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }

        events
    }

    /// Flush a trailing unterminated line and any pending event.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
        } else if line.starts_with(':') {
            // keep-alive comment
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        parse_data(&data, events);
    }
}

fn parse_data(data: &str, events: &mut Vec<SseEvent>) {
    if data.trim() == "[DONE]" {
        events.push(SseEvent::Done);
        return;
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            events.push(SseEvent::Error(format!("undecodable chunk: {e}")));
            return;
        }
    };

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        events.push(SseEvent::Error(message));
        return;
    }

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() {
                events.push(SseEvent::Delta(text));
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(SseEvent::Finished(reason));
        }
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    /// End-of-message seen
    completed: bool,
    /// Nothing more will be read from the body
    finished: bool,
}

impl<S> SseState<S> {
    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                break;
            }
            match event {
                SseEvent::Delta(text) => self.pending.push_back(Ok(text)),
                SseEvent::Finished(reason) => {
                    debug!(finish_reason = %reason, "Model finished");
                    self.completed = true;
                }
                SseEvent::Done => {
                    self.completed = true;
                    self.finished = true;
                }
                SseEvent::Error(message) => {
                    self.pending
                        .push_back(Err(DistillError::StreamTransport(message)));
                    self.finished = true;
                }
            }
        }
    }
}

/// Turn a raw response body into a [`TextStream`].
///
/// The returned stream yields each text delta in order. A body error, an
/// in-band error event, or the body ending before end-of-message becomes a
/// final `Err(StreamTransport)` item.
pub fn sse_text_stream<S, B, E>(body: S) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        completed: false,
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.absorb(events);
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(DistillError::StreamTransport(format!(
                        "connection failed mid-stream: {e}"
                    ))));
                    st.finished = true;
                }
                None => {
                    let events = st.decoder.finish();
                    st.absorb(events);
                    if !st.finished {
                        if !st.completed {
                            st.pending.push_back(Err(DistillError::StreamTransport(
                                "stream closed before completion signal".to_string(),
                            )));
                        }
                        st.finished = true;
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
        )
    }

    fn body(parts: Vec<std::result::Result<Vec<u8>, String>>) -> TextStream {
        sse_text_stream(futures::stream::iter(parts))
    }

    async fn collect(stream: TextStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[test]
    fn test_decoder_split_across_chunks() {
        let full = format!("{}{}data: [DONE]\n\n", delta("<think>"), delta("héllo"));
        let bytes = full.as_bytes();
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for piece in bytes.chunks(5) {
            events.extend(decoder.push(piece));
        }
        events.extend(decoder.finish());

        assert_eq!(
            events,
            vec![
                SseEvent::Delta("<think>".to_string()),
                SseEvent::Delta("héllo".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn test_decoder_ignores_comments_and_empty_deltas() {
        let mut decoder = SseDecoder::new();
        let text = ": OPENROUTER PROCESSING\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n\r\n";
        assert!(decoder.push(text.as_bytes()).is_empty());
    }

    #[test]
    fn test_decoder_in_band_error() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.push(b"data: {\"error\": {\"message\": \"upstream overloaded\", \"code\": 502}}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Error("upstream overloaded".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stream_completes_on_done() {
        let items = collect(body(vec![
            Ok(delta("<think>a").into_bytes()),
            Ok(delta("</think>\\boxed{4}").into_bytes()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ]))
        .await;

        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["<think>a", "</think>\\boxed{4}"]);
    }

    #[tokio::test]
    async fn test_finish_reason_without_done_is_complete() {
        let finish = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
        let items = collect(body(vec![
            Ok(delta("x").into_bytes()),
            Ok(finish.as_bytes().to_vec()),
        ]))
        .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[tokio::test]
    async fn test_premature_close_yields_transport_error_last() {
        let items = collect(body(vec![Ok(delta("<think>foo").into_bytes())])).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "<think>foo");
        assert!(matches!(items[1], Err(DistillError::StreamTransport(_))));
    }

    #[tokio::test]
    async fn test_body_error_after_fragments() {
        let items = collect(body(vec![
            Ok(delta("one").into_bytes()),
            Ok(delta("two").into_bytes()),
            Err("connection reset".to_string()),
            Ok(delta("never").into_bytes()),
        ]))
        .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_ref().unwrap(), "two");
        match &items[2] {
            Err(DistillError::StreamTransport(msg)) => assert!(msg.contains("connection reset")),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }
}
