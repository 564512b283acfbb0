//! `Store` trait: single async interface for all dispatch persistence.
//!
//! Plain reads and inserts return `DatabaseError`. State transitions return
//! `DispatchError` so they can report a lost race or ownership mismatch;
//! each one runs as a single transaction and either commits a valid
//! transition or leaves every row untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::LimiterConfig;
use crate::dispatch::gate::ClaimGate;
use crate::error::{DatabaseError, DispatchError};
use crate::jobs::{
    Disposition, FailureRecord, Job, JobAttempt, JobId, Outcome, OutputId, OutputRecord, Worker,
    WorkerId,
};
use crate::ratelimit::bucket::{RateLimitDecision, RateLimitState};

/// Result of a final submission.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub job: Job,
    pub disposition: Disposition,
    /// Janitor id the claim carried before it was settled.
    pub released_janitor: Option<Uuid>,
}

/// A job returned to the pending pool by the dead-job sweep.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub failure: FailureRecord,
    /// Janitor id of the abandoned claim.
    pub released_janitor: Option<Uuid>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Outputs ─────────────────────────────────────────────────────

    async fn insert_output(&self, output: &OutputRecord) -> Result<(), DatabaseError>;

    async fn get_output(&self, id: OutputId) -> Result<Option<OutputRecord>, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, DatabaseError>;

    /// Resolve a worker from its secret and bump `last_seen_at`.
    async fn authenticate_worker(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Worker>, DatabaseError>;

    /// Swap `current` for `new`. Returns the worker id, or `None` if `current`
    /// matched nobody.
    async fn rotate_worker_key(
        &self,
        current: &str,
        new: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerId>, DatabaseError>;

    // ── Jobs: reads ─────────────────────────────────────────────────

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    async fn list_jobs_for_output(&self, output_id: OutputId) -> Result<Vec<Job>, DatabaseError>;

    async fn has_pending_jobs(&self) -> Result<bool, DatabaseError>;

    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, DatabaseError>;

    async fn list_failures(&self, job_id: Option<JobId>) -> Result<Vec<FailureRecord>, DatabaseError>;

    // ── Jobs: transitions ───────────────────────────────────────────

    /// Insert a pending job after checking its target is a job-eligible output.
    async fn insert_job(&self, job: &Job) -> Result<(), DispatchError>;

    /// Hand the oldest eligible pending job to `worker_id`.
    ///
    /// Jobs whose target this worker already failed are only granted when
    /// `gate` admits the repeat. Records a running attempt on success.
    async fn claim_next_job(
        &self,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
        gate: &dyn ClaimGate,
    ) -> Result<Option<Job>, DispatchError>;

    /// Refresh an owned job: new janitor id and a strictly later `last_update_at`.
    async fn heartbeat_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError>;

    /// Append a streamed chunk to the job's output and refresh the heartbeat.
    async fn append_output(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: &str,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError>;

    /// Append the last chunk and settle the job per `outcome` and the retry bound.
    async fn finalize_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: &str,
        outcome: Outcome,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Finalized, DispatchError>;

    /// Janitor firing: mark the job timed out if the same claim still holds it.
    /// Returns whether anything changed.
    async fn expire_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;

    /// Return in-progress jobs untouched since `cutoff` to pending, writing a
    /// failure record for each. At most `limit` jobs per call.
    async fn reclaim_dead_jobs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reclaimed>, DispatchError>;

    // ── Rate limits ─────────────────────────────────────────────────

    async fn get_rate_limit(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<RateLimitState>, DatabaseError>;

    /// Check-and-consume in one transaction.
    async fn consume_rate_limit(
        &self,
        name: &str,
        key: &str,
        config: &LimiterConfig,
        cost: u32,
        reserve: bool,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DatabaseError>;

    async fn reset_rate_limit(&self, name: &str, key: &str) -> Result<bool, DatabaseError>;
}
