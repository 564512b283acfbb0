//! The worker loop: wait, claim, generate, report.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{LlmError, TransportError};
use crate::jobs::{ClaimedJob, JobId, Outcome};
use crate::worker::backoff::{RetryError, retry_with_backoff};
use crate::worker::chunker::ChunkBuffer;
use crate::worker::source::CompletionSource;
use crate::worker::transport::WorkerTransport;

/// Why generating a job's completion stopped.
#[derive(Debug, thiserror::Error)]
enum GenerateError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Drives one worker identity until shut down.
pub struct WorkerRunner {
    transport: Arc<dyn WorkerTransport>,
    source: Arc<dyn CompletionSource>,
    config: WorkerConfig,
}

impl WorkerRunner {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        source: Arc<dyn CompletionSource>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transport,
            source,
            config,
        }
    }

    /// Process jobs until `shutdown` turns true or its sender is dropped.
    /// A job in progress is finished before returning. Returns the number of
    /// jobs settled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!(source = self.source.name(), "Worker started");
        let mut settled = 0;
        let mut next: Option<ClaimedJob> = None;

        while !*shutdown.borrow() {
            let job = match next.take() {
                Some(job) => job,
                None => match self.transport.claim().await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            waited = self.transport.wait_for_work(self.config.wait_timeout) => {
                                if let Err(e) = waited {
                                    warn!(error = %e, "Waiting for work failed");
                                    if !self.pause(&mut shutdown).await {
                                        break;
                                    }
                                }
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Claim failed");
                        if !self.pause(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            match self.process(&job).await {
                Ok(following) => {
                    settled += 1;
                    next = following;
                }
                Err(e) if e.is_claim_lost() => {
                    warn!(job_id = %job.job_id, error = %e, "Lost claim on job");
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Job processing failed");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(settled, "Worker stopped");
        settled
    }

    /// Generate and settle one job. Returns the next job handed back with the
    /// final submission.
    pub async fn process(&self, job: &ClaimedJob) -> Result<Option<ClaimedJob>, TransportError> {
        debug!(job_id = %job.job_id, retry_count = job.retry_count, "Processing job");
        let heartbeat = self.spawn_heartbeat(job.job_id);
        let generated = self.generate(job).await;
        heartbeat.abort();

        match generated {
            Ok(rest) => {
                self.transport
                    .submit_final(job.job_id, &rest, Outcome::Success)
                    .await
            }
            Err(GenerateError::Llm(e)) => {
                warn!(job_id = %job.job_id, error = %e, "Completion failed");
                self.transport
                    .submit_final(job.job_id, &e.to_string(), Outcome::Failed)
                    .await
            }
            Err(GenerateError::Transport(e)) => Err(e),
        }
    }

    /// Stream the completion, submitting partials for streaming jobs.
    /// Returns the text not yet submitted.
    async fn generate(&self, job: &ClaimedJob) -> Result<String, GenerateError> {
        let sent = AtomicBool::new(false);
        let this = self;
        let sent_ref = &sent;
        let retried = retry_with_backoff(
            &self.config.retry_backoff,
            self.config.retry_jitter,
            move |_| this.attempt(job, sent_ref),
        )
        .await?;
        if retried.retries > 0 {
            info!(job_id = %job.job_id, retries = retried.retries, "Completion succeeded after retries");
        }
        Ok(retried.value)
    }

    async fn attempt(
        &self,
        job: &ClaimedJob,
        sent: &AtomicBool,
    ) -> Result<String, RetryError<GenerateError>> {
        let classify = |e: LlmError| {
            if e.is_retryable() && !sent.load(Ordering::SeqCst) {
                RetryError::retry(GenerateError::Llm(e))
            } else {
                RetryError::fatal(GenerateError::Llm(e))
            }
        };

        let mut stream = self.source.stream(job).await.map_err(classify)?;
        let mut buffer = ChunkBuffer::new(self.config.flush_len);
        let mut collected = String::new();

        while let Some(part) = stream.next().await {
            let part = part.map_err(classify)?;
            if !job.wants_streaming {
                collected.push_str(&part);
                continue;
            }
            if let Some(chunk) = buffer.push(&part) {
                self.transport
                    .submit_partial(job.job_id, &chunk)
                    .await
                    .map_err(|e| RetryError::fatal(GenerateError::Transport(e)))?;
                sent.store(true, Ordering::SeqCst);
            }
        }

        let total = if job.wants_streaming {
            buffer.total_len()
        } else {
            collected.len()
        };
        if total == 0 {
            return Err(classify(LlmError::EmptyResponse {
                provider: self.source.name().to_string(),
            }));
        }

        Ok(if job.wants_streaming {
            buffer.finish()
        } else {
            collected
        })
    }

    fn spawn_heartbeat(&self, job_id: JobId) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match transport.heartbeat(job_id).await {
                    Ok(()) => debug!(job_id = %job_id, "Heartbeat sent"),
                    Err(e) if e.is_claim_lost() => {
                        warn!(job_id = %job_id, error = %e, "Heartbeat rejected, stopping");
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }

    /// Back off after an unexpected error. Returns false on shutdown.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self
            .config
            .retry_backoff
            .first()
            .copied()
            .unwrap_or(self.config.heartbeat_interval);
        tokio::select! {
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
