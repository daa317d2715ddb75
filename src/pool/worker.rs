//! Worker pool for trace generation.
//!
//! Epistemic foundation:
//! - K_i: Records are independent; one stream in flight per worker
//! - K_i: Every job yields exactly one generation, whatever happens to it
//! - I^B: Endpoint failures, dropped streams and deadlines → truncated generation
//! - I^R: Pool size and per-record deadline are configurable

use crate::models::{DistillError, Generation, ProblemRecord};
use crate::pool::TraceRequester;
use crate::stream::{accumulate, Accumulated};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One unit of work: a record and which sample of it to draw.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub record_index: usize,
    pub sample_index: usize,
    pub record: ProblemRecord,
}

/// Bounded pool of concurrent generations.
#[derive(Clone)]
pub struct WorkerPool {
    requester: Arc<TraceRequester>,
    semaphore: Arc<Semaphore>,
    pool_size: usize,
    record_timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(requester: Arc<TraceRequester>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            requester,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            record_timeout: None,
        }
    }

    /// Abort a record's stream once `timeout` has passed since it started.
    pub fn with_record_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.record_timeout = timeout;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn model(&self) -> &str {
        self.requester.model()
    }

    /// Generate one trace. Never fails; failures become a truncated generation.
    pub async fn generate(&self, job: GenerationJob) -> Generation {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return self.finish(job, Accumulated::failed("worker pool closed"), 0);
        };

        let start = Instant::now();
        let deadline = self
            .record_timeout
            .map(|t| tokio::time::Instant::now() + t);

        debug!(
            record_index = job.record_index,
            sample_index = job.sample_index,
            backend = %self.requester.backend_name(),
            "Requesting trace"
        );

        let opened = match deadline {
            Some(at) => tokio::time::timeout_at(at, self.requester.request(&job.record))
                .await
                .unwrap_or_else(|_| {
                    Err(DistillError::StreamTransport(
                        "record deadline exceeded before the stream opened".to_string(),
                    ))
                }),
            None => self.requester.request(&job.record).await,
        };

        let accumulated = match opened {
            Ok(stream) => accumulate(stream, deadline).await,
            Err(e) => {
                warn!(
                    record_index = job.record_index,
                    sample_index = job.sample_index,
                    error = %e,
                    "Could not open stream"
                );
                Accumulated::failed(e.to_string())
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.finish(job, accumulated, elapsed_ms)
    }

    fn finish(&self, job: GenerationJob, accumulated: Accumulated, elapsed_ms: u64) -> Generation {
        Generation {
            record_index: job.record_index,
            sample_index: job.sample_index,
            record: job.record,
            text: accumulated.text,
            status: accumulated.status,
            stream_error: accumulated.failure,
            model: self.requester.model().to_string(),
            generated_at: Utc::now(),
            generation_time_ms: elapsed_ms,
        }
    }

    /// Generate a batch concurrently. Output order matches input order.
    pub async fn generate_batch(&self, jobs: Vec<GenerationJob>) -> Vec<Generation> {
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let pool = self.clone();
            let fallback = job.clone();
            let handle = tokio::spawn(async move { pool.generate(job).await });
            handles.push((fallback, handle));
        }

        let mut generations = Vec::with_capacity(handles.len());
        for (fallback, handle) in handles {
            match handle.await {
                Ok(generation) => generations.push(generation),
                Err(e) => {
                    warn!(
                        record_index = fallback.record_index,
                        sample_index = fallback.sample_index,
                        error = %e,
                        "Task panicked"
                    );
                    generations.push(self.finish(
                        fallback,
                        Accumulated::failed(format!("worker task failed: {e}")),
                        0,
                    ));
                }
            }
        }

        generations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CompletionBackend, CompletionRequest, DecodingParams, TextStream};
    use crate::models::{ApiError, Result, StreamStatus};
    use futures::future::BoxFuture;
    use futures::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `"<think>{problem}</think>"`, tracking peak concurrency.
    struct Recorder {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CompletionBackend for Recorder {
        fn submit<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<TextStream>> {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                let prompt = request.messages[0].content.clone();
                if prompt == "boom" {
                    return Err(DistillError::Api(ApiError::AuthenticationFailed));
                }
                let fragments = vec![Ok("<think>".to_string()), Ok(prompt), Ok("</think>".to_string())];
                Ok(futures::stream::iter(fragments).boxed())
            }
            .boxed()
        }
    }

    fn pool(size: usize) -> (WorkerPool, Arc<Recorder>) {
        let backend = Arc::new(Recorder {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let requester =
            TraceRequester::new(backend.clone(), "m", DecodingParams::default(), "{problem}").unwrap();
        (WorkerPool::new(Arc::new(requester), size), backend)
    }

    fn jobs(problems: &[&str]) -> Vec<GenerationJob> {
        problems
            .iter()
            .enumerate()
            .map(|(i, p)| GenerationJob {
                record_index: i,
                sample_index: 0,
                record: ProblemRecord::new(*p, "1"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_bounds_concurrency() {
        let (pool, backend) = pool(2);
        let out = pool
            .generate_batch(jobs(&["a", "b", "c", "d", "e"]))
            .await;

        let texts: Vec<&str> = out.iter().map(|g| g.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "<think>a</think>",
                "<think>b</think>",
                "<think>c</think>",
                "<think>d</think>",
                "<think>e</think>"
            ]
        );
        assert!(out.iter().all(|g| g.status == StreamStatus::Complete));
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_open_failure_becomes_truncated_empty() {
        let (pool, _) = pool(1);
        let out = pool.generate_batch(jobs(&["ok", "boom"])).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].record_index, 1);
        assert_eq!(out[1].text, "");
        assert_eq!(out[1].status, StreamStatus::Truncated);
        assert!(out[1]
            .stream_error
            .as_deref()
            .unwrap()
            .contains("Authentication failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_timeout_covers_stream_opening() {
        let (pool, _) = pool(1);
        let pool = pool.with_record_timeout(Some(Duration::from_millis(5)));
        let out = pool.generate(jobs(&["slow"]).remove(0)).await;

        assert_eq!(out.status, StreamStatus::Truncated);
        assert!(out.stream_error.unwrap().contains("deadline"));
    }
}
