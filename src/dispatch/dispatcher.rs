//! The dispatcher: enqueue, claim, heartbeat, result assembly, and sweep.
//!
//! Every state change is delegated to a single `Store` transaction; the
//! dispatcher adds authentication, rate limiting, deadline timers, and the
//! "work exists" signal on top.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::dispatch::gate::{ClaimGate, ProbabilisticGate};
use crate::dispatch::janitor::JanitorRegistry;
use crate::dispatch::registry::WorkerRegistry;
use crate::error::DispatchError;
use crate::jobs::{
    AuthorRole, ClaimedJob, Disposition, FailureRecord, Job, JobAttempt, JobId, Outcome,
    OutputId, OutputRecord, Registration, SweepReport, Worker, WorkerId,
};
use crate::ratelimit::{ENQUEUE_JOB, REGISTER_WORKER, RateLimitDecision, RateLimiter};
use crate::store::Store;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn ClaimGate>,
    limiter: RateLimiter,
    workers: WorkerRegistry,
    janitors: JanitorRegistry,
    work_tx: watch::Sender<bool>,
    /// Orders signal refreshes so a stale read never overwrites a newer one.
    signal_lock: Mutex<()>,
}

impl Dispatcher {
    /// Build a dispatcher on the system clock with the probabilistic claim gate.
    pub async fn new(store: Arc<dyn Store>, config: DispatchConfig) -> Result<Self, DispatchError> {
        let gate = Arc::new(ProbabilisticGate::new(config.retry_same_worker_probability));
        Self::with_parts(store, config, Arc::new(SystemClock), gate).await
    }

    pub async fn with_parts(
        store: Arc<dyn Store>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
        gate: Arc<dyn ClaimGate>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let pending = store.has_pending_jobs().await?;
        let (work_tx, _) = watch::channel(pending);

        Ok(Self {
            limiter: RateLimiter::new(
                Arc::clone(&store),
                config.rate_limits.clone(),
                Arc::clone(&clock),
            ),
            workers: WorkerRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
            janitors: JanitorRegistry::new(),
            store,
            config,
            clock,
            gate,
            work_tx,
            signal_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn janitors(&self) -> &JanitorRegistry {
        &self.janitors
    }

    // ── Producer side ───────────────────────────────────────────────

    /// Create an output record. Assistant outputs start out `generating`.
    pub async fn create_output(
        &self,
        role: AuthorRole,
        content: impl Into<String>,
    ) -> Result<OutputRecord, DispatchError> {
        let output = OutputRecord::new(role, content, self.clock.now());
        self.store.insert_output(&output).await?;
        Ok(output)
    }

    pub async fn get_output(&self, id: OutputId) -> Result<OutputRecord, DispatchError> {
        self.store
            .get_output(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("output", id))
    }

    /// Queue a completion job for `target_output_id`, rate limited per `caller_key`.
    pub async fn enqueue(
        &self,
        caller_key: &str,
        target_output_id: OutputId,
        wants_streaming: bool,
    ) -> Result<JobId, DispatchError> {
        self.limiter.limit(ENQUEUE_JOB, caller_key).await?;

        let job = Job::new(target_output_id, wants_streaming, self.clock.now());
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, output_id = %target_output_id, "Job enqueued");

        self.refresh_work_signal().await?;
        Ok(job.id)
    }

    // ── Worker registry ─────────────────────────────────────────────

    pub async fn register(
        &self,
        caller_key: &str,
        display_name: Option<String>,
    ) -> Result<Registration, DispatchError> {
        self.limiter.limit(REGISTER_WORKER, caller_key).await?;
        self.workers.register(display_name).await
    }

    pub async fn rotate_secret(&self, current: &SecretString) -> Result<SecretString, DispatchError> {
        self.workers.rotate(current).await
    }

    pub async fn authenticate(&self, api_key: &SecretString) -> Result<Worker, DispatchError> {
        self.workers.authenticate(api_key).await
    }

    // ── Worker side ─────────────────────────────────────────────────

    /// Claim the next eligible job, if any.
    pub async fn claim(&self, api_key: &SecretString) -> Result<Option<ClaimedJob>, DispatchError> {
        let worker = self.authenticate(api_key).await?;
        self.claim_for(worker.id).await
    }

    /// Keep a claimed job alive.
    pub async fn heartbeat(&self, api_key: &SecretString, job_id: JobId) -> Result<(), DispatchError> {
        let worker = self.authenticate(api_key).await?;
        let janitor_id = Uuid::new_v4();
        self.store
            .heartbeat_job(job_id, worker.id, janitor_id, self.clock.now())
            .await?;
        self.arm_janitor(job_id, worker.id, janitor_id);
        debug!(job_id = %job_id, worker_id = %worker.id, "Heartbeat");
        Ok(())
    }

    /// Append a streamed chunk. Also counts as a heartbeat.
    pub async fn submit_partial(
        &self,
        api_key: &SecretString,
        job_id: JobId,
        chunk: &str,
    ) -> Result<(), DispatchError> {
        let worker = self.authenticate(api_key).await?;
        let janitor_id = Uuid::new_v4();
        self.store
            .append_output(job_id, worker.id, chunk, janitor_id, self.clock.now())
            .await?;
        self.arm_janitor(job_id, worker.id, janitor_id);
        Ok(())
    }

    /// Append the last chunk and settle the job, then hand back the worker's next job.
    pub async fn submit_final(
        &self,
        api_key: &SecretString,
        job_id: JobId,
        chunk: &str,
        outcome: Outcome,
    ) -> Result<Option<ClaimedJob>, DispatchError> {
        let worker = self.authenticate(api_key).await?;
        let finalized = self
            .store
            .finalize_job(
                job_id,
                worker.id,
                chunk,
                outcome,
                self.config.max_retries,
                self.clock.now(),
            )
            .await?;
        // The job may already be re-claimed by another worker; only drop our own timer.
        if let Some(released) = finalized.released_janitor {
            self.janitors.cancel_if(job_id, released);
        }

        match finalized.disposition {
            Disposition::Completed => {
                info!(job_id = %job_id, worker_id = %worker.id, "Job completed");
            }
            Disposition::Requeued { retry_count } => {
                info!(job_id = %job_id, worker_id = %worker.id, retry_count, "Job failed, re-queued");
                self.refresh_work_signal().await?;
            }
            Disposition::Exhausted { attempts } => {
                let err = DispatchError::ExhaustedRetries { job_id, attempts };
                warn!(job_id = %job_id, output_id = %finalized.job.target_output_id, "{err}");
            }
        }

        self.claim_for(worker.id).await
    }

    /// Whether any job is waiting to be claimed.
    pub async fn is_there_work(&self) -> Result<bool, DispatchError> {
        Ok(self.store.has_pending_jobs().await?)
    }

    /// Resolve once a pending job exists. Cancel by dropping the future.
    pub async fn wait_for_work(&self) {
        let mut rx = self.work_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|pending| *pending).await;
    }

    /// Observe the "work exists" flag directly.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.work_tx.subscribe()
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_job(&self, id: JobId) -> Result<Job, DispatchError> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("job", id))
    }

    pub async fn jobs_for_output(&self, output_id: OutputId) -> Result<Vec<Job>, DispatchError> {
        Ok(self.store.list_jobs_for_output(output_id).await?)
    }

    pub async fn attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, DispatchError> {
        Ok(self.store.list_attempts(job_id).await?)
    }

    pub async fn failures(&self, job_id: Option<JobId>) -> Result<Vec<FailureRecord>, DispatchError> {
        Ok(self.store.list_failures(job_id).await?)
    }

    /// Availability of one unit on a limiter, without consuming it.
    pub async fn check_rate_limit(
        &self,
        name: &str,
        key: &str,
    ) -> Result<RateLimitDecision, DispatchError> {
        self.limiter.check(name, key, 1).await
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Return jobs whose worker went silent to the pending pool.
    pub async fn sweep(&self) -> Result<SweepReport, DispatchError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.dead_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let reclaimed = self
            .store
            .reclaim_dead_jobs(now - threshold, now, self.config.sweep_batch)
            .await?;

        let mut report = SweepReport::default();
        for entry in reclaimed {
            if let Some(released) = entry.released_janitor {
                self.janitors.cancel_if(entry.failure.job_id, released);
            }
            warn!(
                job_id = %entry.failure.job_id,
                worker_id = %entry.failure.worker_id,
                "Reclaimed job from unresponsive worker"
            );
            report.reclaimed.push(entry.failure);
        }
        if !report.is_empty() {
            self.refresh_work_signal().await?;
        }
        Ok(report)
    }

    async fn claim_for(&self, worker_id: WorkerId) -> Result<Option<ClaimedJob>, DispatchError> {
        let janitor_id = Uuid::new_v4();
        let claimed = self
            .store
            .claim_next_job(worker_id, janitor_id, self.clock.now(), self.gate.as_ref())
            .await?;

        let Some(job) = claimed else {
            return Ok(None);
        };
        self.arm_janitor(job.id, worker_id, janitor_id);
        info!(job_id = %job.id, worker_id = %worker_id, retry_count = job.retry_count, "Job claimed");

        self.refresh_work_signal().await?;
        Ok(Some(ClaimedJob::from(&job)))
    }

    fn arm_janitor(&self, job_id: JobId, worker_id: WorkerId, janitor_id: Uuid) {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        self.janitors
            .arm(job_id, janitor_id, self.config.dead_timeout, async move {
                match store.expire_job(job_id, worker_id, janitor_id, clock.now()).await {
                    Ok(true) => {
                        warn!(job_id = %job_id, worker_id = %worker_id, "Job timed out without a heartbeat");
                    }
                    Ok(false) => {
                        debug!(job_id = %job_id, "Stale janitor fired, nothing to expire");
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to expire job");
                    }
                }
            });
    }

    async fn refresh_work_signal(&self) -> Result<(), DispatchError> {
        let _guard = self.signal_lock.lock().await;
        let pending = self.store.has_pending_jobs().await?;
        self.work_tx.send_if_modified(|current| {
            let changed = *current != pending;
            *current = pending;
            changed
        });
        Ok(())
    }
}
