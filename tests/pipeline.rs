//! End-to-end distillation against a scripted in-memory backend.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tracedistill::client::{CompletionBackend, CompletionRequest, DecodingParams, TextStream};
use tracedistill::{
    filter_dataset, CheckpointManager, DistillError, DistillPipeline, FilteredReason, JsonlCorpus,
    ReasoningTrace, Result, StreamStatus, TraceRequester, TraceValidator, WorkerPool,
};

/// What the backend does for one prompt.
#[derive(Clone)]
enum Script {
    /// Send these fragments, then end normally
    Reply(Vec<&'static str>),
    /// Send these fragments, then drop the connection
    Drop(Vec<&'static str>),
}

struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(p, s)| (p.to_string(), s.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

impl CompletionBackend for ScriptedBackend {
    fn submit<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<TextStream>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(&request.messages[0].content)
            .cloned()
            .unwrap_or(Script::Reply(vec![]));

        async move {
            let items: Vec<Result<String>> = match script {
                Script::Reply(parts) => parts.into_iter().map(|p| Ok(p.to_string())).collect(),
                Script::Drop(parts) => parts
                    .into_iter()
                    .map(|p| Ok(p.to_string()))
                    .chain(std::iter::once(Err(DistillError::StreamTransport(
                        "connection reset".to_string(),
                    ))))
                    .collect(),
            };
            Ok(futures::stream::iter(items).boxed())
        }
        .boxed()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn pipeline(backend: Arc<ScriptedBackend>, samples: usize) -> DistillPipeline {
    let requester =
        TraceRequester::new(backend, "test-model", DecodingParams::default(), "{problem}").unwrap();
    DistillPipeline::new(
        WorkerPool::new(Arc::new(requester), 3),
        TraceValidator::default(),
        samples,
    )
    .with_progress(false)
}

fn corpus(rows: &str) -> TempDir {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("math")).unwrap();
    std::fs::write(dir.path().join("math").join("test.jsonl"), rows).unwrap();
    dir
}

fn read_rows(path: &Path) -> Vec<ReasoningTrace> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const ROWS: &str = r#"{"problem": "What is 2+2?", "answer": "4", "source": "arith"}
{"problem": "Halve one.", "answer": "\\frac{1}{2}"}
{"problem": "No tags.", "answer": "4"}
{"problem": "Cut off.", "answer": "4"}
{"problem": "Unknown answer.", "id": 17}
"#;

fn scripts() -> Arc<ScriptedBackend> {
    ScriptedBackend::new(&[
        (
            "What is 2+2?",
            Script::Reply(vec!["<think>", "2 plus 2", "</think>", "The answer is \\boxed{4}."]),
        ),
        (
            "Halve one.",
            Script::Reply(vec!["<think>half</think>\\boxed{0.5}"]),
        ),
        ("No tags.", Script::Reply(vec!["Just \\boxed{4}"])),
        ("Cut off.", Script::Drop(vec!["<think>foo"])),
        (
            "Unknown answer.",
            Script::Reply(vec!["<think>hm</think>\\boxed{3}"]),
        ),
    ])
}

#[tokio::test]
async fn distill_writes_every_trace_with_its_reason() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();
    let output = out.path().join("traces.jsonl");
    let backend = scripts();

    let stats = pipeline(backend.clone(), 1)
        .distill(&JsonlCorpus::new(data.path()), "math", "test", &output, None)
        .await
        .unwrap();

    let rows = read_rows(&output);
    assert_eq!(rows.len(), 5);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 5);

    let reasons: Vec<FilteredReason> = rows.iter().map(|r| r.filtered_reason).collect();
    assert_eq!(
        reasons,
        vec![
            FilteredReason::Valid,
            FilteredReason::Valid,
            FilteredReason::InvalidFormat,
            FilteredReason::InvalidFormat,
            FilteredReason::IncorrectAnswer,
        ]
    );
    assert!(rows.iter().all(ReasoningTrace::is_consistent));

    // Fragments are concatenated in arrival order
    assert_eq!(
        rows[0].reasoning_trace,
        "<think>2 plus 2</think>The answer is \\boxed{4}."
    );
    assert_eq!(rows[0].extracted_answer.as_deref(), Some("4"));
    assert_eq!(rows[0].record.extra["source"], "arith");

    // The partial trace is kept, marked truncated
    assert_eq!(rows[3].reasoning_trace, "<think>foo");
    assert_eq!(rows[3].stream_status, StreamStatus::Truncated);
    assert!(rows[3].stream_error.as_deref().unwrap().contains("connection reset"));

    // Missing ground truth is kept as an empty answer, never VALID
    assert_eq!(rows[4].record.answer, "");
    assert_eq!(rows[4].record.extra["source_id"], 17);

    assert_eq!(stats.total_records, 5);
    assert_eq!(stats.total_traces, 5);
    assert_eq!(stats.valid, 2);
    assert_eq!(stats.invalid_format, 2);
    assert_eq!(stats.incorrect_answer, 1);
    assert_eq!(stats.truncated, 1);
    assert!((stats.acceptance_rate - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn filter_step_yields_final_dataset() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();
    let output = out.path().join("traces.jsonl");
    let final_path = out.path().join("final.jsonl");

    pipeline(scripts(), 1)
        .distill(&JsonlCorpus::new(data.path()), "math", "test", &output, None)
        .await
        .unwrap();
    let stats = filter_dataset(&output, &final_path).unwrap();

    assert_eq!(stats.total, 5);
    assert_eq!(stats.kept, 2);
    let kept = read_rows(&final_path);
    assert!(kept.iter().all(|r| !r.filtered && r.filtered_reason == FilteredReason::Valid));
    assert_eq!(kept[0].record.problem, "What is 2+2?");
    assert_eq!(kept[1].record.problem, "Halve one.");
}

#[tokio::test]
async fn samples_multiply_rows_per_record() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();
    let output = out.path().join("traces.jsonl");

    let stats = pipeline(scripts(), 3)
        .distill(&JsonlCorpus::new(data.path()).with_limit(Some(2)), "math", "test", &output, None)
        .await
        .unwrap();

    let rows = read_rows(&output);
    let pairs: Vec<(usize, usize)> = rows.iter().map(|r| (r.record_index, r.sample_index)).collect();
    assert_eq!(pairs, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    assert_eq!(stats.total_traces, 6);
    assert_eq!(stats.valid, 6);
}

#[tokio::test]
async fn checkpoint_resume_skips_finished_records() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();
    let output = out.path().join("traces.jsonl");
    let checkpoints = out.path().join("checkpoints");
    let source = JsonlCorpus::new(data.path());

    let first = scripts();
    let checkpoint = CheckpointManager::for_output(&checkpoints, &output).unwrap();
    let stats = pipeline(first.clone(), 1)
        .distill(&source, "math", "test", &output, Some(checkpoint))
        .await
        .unwrap();
    assert_eq!(first.calls.load(Ordering::SeqCst), 5);
    assert_eq!(stats.valid, 2);

    let second = scripts();
    let checkpoint = CheckpointManager::for_output(&checkpoints, &output).unwrap();
    assert!(checkpoint.exists());
    let resumed = pipeline(second.clone(), 1)
        .distill(&source, "math", "test", &output, Some(checkpoint))
        .await
        .unwrap();

    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    assert_eq!(read_rows(&output).len(), 5);
    assert_eq!(resumed.total_traces, 5);
    assert_eq!(resumed.valid, 2);
    assert_eq!(resumed.truncated, 1);
}

#[tokio::test]
async fn checkpoint_for_other_run_is_rejected() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();
    let output = out.path().join("traces.jsonl");
    let checkpoints = out.path().join("checkpoints");
    let source = JsonlCorpus::new(data.path());

    let checkpoint = CheckpointManager::for_output(&checkpoints, &output).unwrap();
    pipeline(scripts(), 1)
        .distill(&source, "math", "test", &output, Some(checkpoint))
        .await
        .unwrap();

    let checkpoint = CheckpointManager::for_output(&checkpoints, &output).unwrap();
    let err = pipeline(scripts(), 2)
        .distill(&source, "math", "test", &output, Some(checkpoint))
        .await
        .unwrap_err();
    assert!(matches!(err, DistillError::InvalidInput(_)));
}

#[tokio::test]
async fn missing_split_is_fatal() {
    let data = corpus(ROWS);
    let out = tempdir().unwrap();

    let err = pipeline(scripts(), 1)
        .distill(
            &JsonlCorpus::new(data.path()),
            "math",
            "train",
            &out.path().join("traces.jsonl"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DistillError::DataUnavailable { .. }));
}
