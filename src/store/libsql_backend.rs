//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All access goes through one
//! connection guarded by an async mutex, so a transaction opened by one
//! operation never sees statements from another.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LimiterConfig;
use crate::dispatch::gate::ClaimGate;
use crate::error::{DatabaseError, DispatchError};
use crate::jobs::{
    AttemptOutcome, AuthorRole, Disposition, FailureRecord, Job, JobAttempt, JobId, JobStatus,
    Outcome, OutputId, OutputRecord, OutputState, UnknownTag, Worker, WorkerId,
};
use crate::ratelimit::bucket::{self, RateLimitDecision, RateLimitState};
use crate::store::migrations;
use crate::store::traits::{Finalized, Reclaimed, Store};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    /// Open an IMMEDIATE transaction so the write lock is taken up front.
    async fn begin(&self, op: &'static str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Transaction(format!("{op}: begin: {e}")))
    }
}

/// Commit on `Ok`, roll back on `Err`.
async fn finish<T, E>(tx: Transaction, op: &'static str, result: Result<T, E>) -> Result<T, E>
where
    E: From<DatabaseError>,
{
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Transaction(format!("{op}: commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(op, error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_tag<T>(s: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = UnknownTag>,
{
    s.parse()
        .map_err(|e: UnknownTag| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text(id.map(|id| id.to_string()).as_deref())
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(ts).as_deref())
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

/// The next `last_update_at`: `now` at stored precision, but always strictly after `prev`.
fn bump(prev: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
        .max(prev + chrono::Duration::microseconds(1))
}

// ── Row mapping ─────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, target_output_id, wants_streaming, status, last_update_at, claimed_by, retry_count, janitor_id, created_at, started_at, ended_at";

const OUTPUT_COLUMNS: &str = "id, role, content, state, created_at, updated_at";

const WORKER_COLUMNS: &str = "id, api_key, display_name, last_seen_at, created_at";

const ATTEMPT_COLUMNS: &str =
    "id, job_id, target_output_id, worker_id, outcome, detail, started_at, ended_at";

const FAILURE_COLUMNS: &str = "id, worker_id, job_id, detected_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: parse_uuid(&text(row, 0)?)?,
        target_output_id: parse_uuid(&text(row, 1)?)?,
        wants_streaming: int(row, 2)? != 0,
        status: parse_tag(&text(row, 3)?)?,
        last_update_at: parse_datetime(&text(row, 4)?),
        claimed_by: row
            .get::<String>(5)
            .ok()
            .map(|s| parse_uuid(&s))
            .transpose()?,
        retry_count: u32::try_from(int(row, 6)?).map_err(|e| {
            DatabaseError::Serialization(format!("retry_count out of range: {e}"))
        })?,
        janitor_id: row
            .get::<String>(7)
            .ok()
            .map(|s| parse_uuid(&s))
            .transpose()?,
        created_at: parse_datetime(&text(row, 8)?),
        started_at: parse_optional_datetime(row.get(9).ok()),
        ended_at: parse_optional_datetime(row.get(10).ok()),
    })
}

fn row_to_output(row: &libsql::Row) -> Result<OutputRecord, DatabaseError> {
    Ok(OutputRecord {
        id: parse_uuid(&text(row, 0)?)?,
        role: parse_tag(&text(row, 1)?)?,
        content: text(row, 2)?,
        state: parse_tag(&text(row, 3)?)?,
        created_at: parse_datetime(&text(row, 4)?),
        updated_at: parse_datetime(&text(row, 5)?),
    })
}

fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    Ok(Worker {
        id: parse_uuid(&text(row, 0)?)?,
        api_key: SecretString::from(text(row, 1)?),
        display_name: row.get::<String>(2).ok(),
        last_seen_at: parse_datetime(&text(row, 3)?),
        created_at: parse_datetime(&text(row, 4)?),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<JobAttempt, DatabaseError> {
    Ok(JobAttempt {
        id: parse_uuid(&text(row, 0)?)?,
        job_id: parse_uuid(&text(row, 1)?)?,
        target_output_id: parse_uuid(&text(row, 2)?)?,
        worker_id: parse_uuid(&text(row, 3)?)?,
        outcome: parse_tag(&text(row, 4)?)?,
        detail: row.get::<String>(5).ok(),
        started_at: parse_datetime(&text(row, 6)?),
        ended_at: parse_optional_datetime(row.get(7).ok()),
    })
}

fn row_to_failure(row: &libsql::Row) -> Result<FailureRecord, DatabaseError> {
    Ok(FailureRecord {
        id: parse_uuid(&text(row, 0)?)?,
        worker_id: parse_uuid(&text(row, 1)?)?,
        job_id: parse_uuid(&text(row, 2)?)?,
        detected_at: parse_datetime(&text(row, 3)?),
    })
}

/// Run a query and map every row.
async fn query_all<T>(
    conn: &Connection,
    op: &'static str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err(op))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// Run a query and map the first row, if any.
async fn query_one<T>(
    conn: &Connection,
    op: &'static str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err(op))?;
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

// ── Statements shared by the transitions ────────────────────────────

async fn fetch_job(conn: &Connection, id: JobId) -> Result<Option<Job>, DatabaseError> {
    query_one(
        conn,
        "get_job",
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id.to_string()],
        row_to_job,
    )
    .await
}

async fn fetch_output(conn: &Connection, id: OutputId) -> Result<Option<OutputRecord>, DatabaseError> {
    query_one(
        conn,
        "get_output",
        &format!("SELECT {OUTPUT_COLUMNS} FROM outputs WHERE id = ?1"),
        params![id.to_string()],
        row_to_output,
    )
    .await
}

/// Load a job and check that `worker_id` currently holds it.
async fn owned_job(
    conn: &Connection,
    job_id: JobId,
    worker_id: WorkerId,
) -> Result<Job, DispatchError> {
    let job = fetch_job(conn, job_id)
        .await?
        .ok_or_else(|| DispatchError::not_found("job", job_id))?;
    if !job.is_owned_by(worker_id) {
        return Err(DispatchError::precondition(format!(
            "job {job_id} is {} and not claimed by worker {worker_id}",
            job.status
        )));
    }
    Ok(job)
}

/// Persist every mutable column of `job`.
async fn write_job(conn: &Connection, op: &'static str, job: &Job) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET status = ?1, last_update_at = ?2, claimed_by = ?3, retry_count = ?4, janitor_id = ?5, started_at = ?6, ended_at = ?7 WHERE id = ?8",
        params![
            job.status.as_str(),
            ts(job.last_update_at),
            opt_uuid(job.claimed_by),
            i64::from(job.retry_count),
            opt_uuid(job.janitor_id),
            opt_ts(job.started_at),
            opt_ts(job.ended_at),
            job.id.to_string(),
        ],
    )
    .await
    .map_err(query_err(op))?;
    Ok(())
}

async fn append_content(
    conn: &Connection,
    op: &'static str,
    output_id: OutputId,
    chunk: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    if chunk.is_empty() {
        return Ok(());
    }
    conn.execute(
        "UPDATE outputs SET content = content || ?1, updated_at = ?2 WHERE id = ?3",
        params![chunk, ts(now), output_id.to_string()],
    )
    .await
    .map_err(query_err(op))?;
    Ok(())
}

async fn set_output_state(
    conn: &Connection,
    op: &'static str,
    output_id: OutputId,
    state: OutputState,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE outputs SET state = ?1, updated_at = ?2 WHERE id = ?3",
        params![state.as_str(), ts(now), output_id.to_string()],
    )
    .await
    .map_err(query_err(op))?;
    Ok(())
}

/// Close the running attempt of `worker_id` on `job_id`.
async fn close_attempt(
    conn: &Connection,
    op: &'static str,
    job_id: JobId,
    worker_id: WorkerId,
    outcome: AttemptOutcome,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_attempts SET outcome = ?1, detail = ?2, ended_at = ?3 WHERE job_id = ?4 AND worker_id = ?5 AND outcome = ?6",
        params![
            outcome.as_str(),
            opt_text(detail),
            ts(now),
            job_id.to_string(),
            worker_id.to_string(),
            AttemptOutcome::Running.as_str(),
        ],
    )
    .await
    .map_err(query_err(op))?;
    Ok(())
}

/// Whether `worker_id` already has an unsuccessful attempt on `target`.
async fn failed_before(
    conn: &Connection,
    target: OutputId,
    worker_id: WorkerId,
) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM job_attempts WHERE target_output_id = ?1 AND worker_id = ?2 AND outcome IN ('failed', 'timed_out', 'abandoned'))",
            params![target.to_string(), worker_id.to_string()],
        )
        .await
        .map_err(query_err("failed_before"))?;
    match rows.next().await.map_err(query_err("failed_before"))? {
        Some(row) => Ok(int(&row, 0)? != 0),
        None => Ok(false),
    }
}

// ── Transitions (run inside a transaction) ──────────────────────────

async fn insert_job_in(conn: &Connection, job: &Job) -> Result<(), DispatchError> {
    let output = fetch_output(conn, job.target_output_id)
        .await?
        .ok_or_else(|| DispatchError::not_found("output", job.target_output_id))?;
    if output.role != AuthorRole::Assistant {
        return Err(DispatchError::precondition(format!(
            "output {} is a {} message, only assistant outputs take jobs",
            output.id, output.role
        )));
    }

    conn.execute(
        &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            job.id.to_string(),
            job.target_output_id.to_string(),
            i64::from(job.wants_streaming),
            job.status.as_str(),
            ts(job.last_update_at),
            opt_uuid(job.claimed_by),
            i64::from(job.retry_count),
            opt_uuid(job.janitor_id),
            ts(job.created_at),
            opt_ts(job.started_at),
            opt_ts(job.ended_at),
        ],
    )
    .await
    .map_err(query_err("insert_job"))?;
    Ok(())
}

async fn claim_in(
    conn: &Connection,
    worker_id: WorkerId,
    janitor_id: Uuid,
    now: DateTime<Utc>,
    gate: &dyn ClaimGate,
) -> Result<Option<Job>, DispatchError> {
    let pending = query_all(
        conn,
        "claim_next_job",
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at, seq"),
        params![JobStatus::Pending.as_str()],
        row_to_job,
    )
    .await?;

    for mut job in pending {
        if failed_before(conn, job.target_output_id, worker_id).await?
            && !gate.admit_repeat(&job, worker_id)
        {
            debug!(job_id = %job.id, worker_id = %worker_id, "Skipping repeat claim");
            continue;
        }

        job.status = JobStatus::InProgress;
        job.claimed_by = Some(worker_id);
        job.janitor_id = Some(janitor_id);
        job.last_update_at = bump(job.last_update_at, now);
        job.started_at = Some(now);
        write_job(conn, "claim_next_job", &job).await?;

        conn.execute(
            &format!("INSERT INTO job_attempts ({ATTEMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL)"),
            params![
                Uuid::new_v4().to_string(),
                job.id.to_string(),
                job.target_output_id.to_string(),
                worker_id.to_string(),
                AttemptOutcome::Running.as_str(),
                ts(now),
            ],
        )
        .await
        .map_err(query_err("claim_next_job"))?;

        return Ok(Some(job));
    }
    Ok(None)
}

async fn heartbeat_in(
    conn: &Connection,
    job_id: JobId,
    worker_id: WorkerId,
    janitor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Job, DispatchError> {
    let mut job = owned_job(conn, job_id, worker_id).await?;
    job.janitor_id = Some(janitor_id);
    job.last_update_at = bump(job.last_update_at, now);
    write_job(conn, "heartbeat_job", &job).await?;
    Ok(job)
}

async fn finalize_in(
    conn: &Connection,
    job_id: JobId,
    worker_id: WorkerId,
    chunk: &str,
    outcome: Outcome,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<Finalized, DispatchError> {
    const OP: &str = "finalize_job";
    let mut job = owned_job(conn, job_id, worker_id).await?;
    let target = job.target_output_id;
    let detail = (!chunk.is_empty()).then_some(chunk);
    let released_janitor = job.janitor_id;

    append_content(conn, OP, target, chunk, now).await?;
    job.claimed_by = None;
    job.janitor_id = None;
    job.last_update_at = bump(job.last_update_at, now);

    let disposition = match outcome {
        Outcome::Success => {
            set_output_state(conn, OP, target, OutputState::Success, now).await?;
            close_attempt(conn, OP, job_id, worker_id, AttemptOutcome::Success, None, now).await?;
            job.status = JobStatus::Success;
            job.ended_at = Some(now);
            Disposition::Completed
        }
        Outcome::Failed if job.retry_count < max_retries => {
            close_attempt(conn, OP, job_id, worker_id, AttemptOutcome::Failed, detail, now).await?;
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.started_at = None;
            Disposition::Requeued {
                retry_count: job.retry_count,
            }
        }
        Outcome::Failed => {
            set_output_state(conn, OP, target, OutputState::Failed, now).await?;
            close_attempt(conn, OP, job_id, worker_id, AttemptOutcome::Failed, detail, now).await?;
            job.status = JobStatus::Failed;
            job.ended_at = Some(now);
            Disposition::Exhausted {
                attempts: job.retry_count + 1,
            }
        }
    };

    write_job(conn, OP, &job).await?;
    Ok(Finalized {
        job,
        disposition,
        released_janitor,
    })
}

async fn expire_in(
    conn: &Connection,
    job_id: JobId,
    worker_id: WorkerId,
    janitor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, DispatchError> {
    const OP: &str = "expire_job";
    let Some(mut job) = fetch_job(conn, job_id).await? else {
        return Ok(false);
    };
    if !job.is_owned_by(worker_id) || job.janitor_id != Some(janitor_id) {
        return Ok(false);
    }

    set_output_state(conn, OP, job.target_output_id, OutputState::TimedOut, now).await?;
    close_attempt(conn, OP, job_id, worker_id, AttemptOutcome::TimedOut, None, now).await?;
    job.status = JobStatus::TimedOut;
    job.claimed_by = None;
    job.janitor_id = None;
    job.last_update_at = bump(job.last_update_at, now);
    job.ended_at = Some(now);
    write_job(conn, OP, &job).await?;
    Ok(true)
}

async fn reclaim_in(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Reclaimed>, DispatchError> {
    const OP: &str = "reclaim_dead_jobs";
    let dead = query_all(
        conn,
        OP,
        &format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 AND last_update_at < ?2 ORDER BY last_update_at LIMIT ?3"
        ),
        params![
            JobStatus::InProgress.as_str(),
            ts(cutoff),
            i64::try_from(limit).unwrap_or(i64::MAX),
        ],
        row_to_job,
    )
    .await?;

    let mut reclaimed = Vec::with_capacity(dead.len());
    for mut job in dead {
        let Some(worker_id) = job.claimed_by else {
            continue;
        };
        let failure = FailureRecord {
            id: Uuid::new_v4(),
            worker_id,
            job_id: job.id,
            detected_at: now,
        };
        conn.execute(
            &format!("INSERT INTO failures ({FAILURE_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"),
            params![
                failure.id.to_string(),
                worker_id.to_string(),
                job.id.to_string(),
                ts(now),
            ],
        )
        .await
        .map_err(query_err(OP))?;

        close_attempt(conn, OP, job.id, worker_id, AttemptOutcome::Abandoned, None, now).await?;

        let released_janitor = job.janitor_id;
        job.status = JobStatus::Pending;
        job.claimed_by = None;
        job.janitor_id = None;
        job.started_at = None;
        job.last_update_at = bump(job.last_update_at, now);
        write_job(conn, OP, &job).await?;

        reclaimed.push(Reclaimed {
            failure,
            released_janitor,
        });
    }
    Ok(reclaimed)
}

async fn fetch_rate_limit(
    conn: &Connection,
    name: &str,
    key: &str,
) -> Result<Option<RateLimitState>, DatabaseError> {
    query_one(
        conn,
        "get_rate_limit",
        "SELECT value, updated_at FROM rate_limits WHERE name = ?1 AND key = ?2",
        params![name, key],
        |row| {
            Ok(RateLimitState {
                value: row
                    .get::<f64>(0)
                    .map_err(|e| DatabaseError::Serialization(format!("column 0: {e}")))?,
                updated_at: parse_datetime(&text(row, 1)?),
            })
        },
    )
    .await
}

async fn consume_rate_limit_in(
    conn: &Connection,
    name: &str,
    key: &str,
    config: &LimiterConfig,
    cost: u32,
    reserve: bool,
    now: DateTime<Utc>,
) -> Result<RateLimitDecision, DatabaseError> {
    let stored = fetch_rate_limit(conn, name, key).await?;
    let eval = bucket::evaluate(config, stored.as_ref(), now, cost, reserve);
    if let Some(next) = eval.next_state {
        conn.execute(
            "INSERT INTO rate_limits (name, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, key, next.value, ts(next.updated_at)],
        )
        .await
        .map_err(query_err("consume_rate_limit"))?;
    }
    Ok(eval.decision)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(&self.conn).await
    }

    // ── Outputs ─────────────────────────────────────────────────────

    async fn insert_output(&self, output: &OutputRecord) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn
            .execute(
                &format!("INSERT INTO outputs ({OUTPUT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    output.id.to_string(),
                    output.role.as_str(),
                    output.content.as_str(),
                    output.state.as_str(),
                    ts(output.created_at),
                    ts(output.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_output"))?;
        debug!(output_id = %output.id, role = %output.role, "Output inserted");
        Ok(())
    }

    async fn get_output(&self, id: OutputId) -> Result<Option<OutputRecord>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_output(&self.conn, id).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn
            .execute(
                &format!("INSERT INTO workers ({WORKER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    worker.id.to_string(),
                    worker.api_key.expose_secret(),
                    opt_text(worker.display_name.as_deref()),
                    ts(worker.last_seen_at),
                    ts(worker.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_worker"))?;
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_one(
            &self.conn,
            "get_worker",
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![id.to_string()],
            row_to_worker,
        )
        .await
    }

    async fn authenticate_worker(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Worker>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_one(
            &self.conn,
            "authenticate_worker",
            &format!(
                "UPDATE workers SET last_seen_at = ?1 WHERE api_key = ?2 RETURNING {WORKER_COLUMNS}"
            ),
            params![ts(now), api_key],
            row_to_worker,
        )
        .await
    }

    async fn rotate_worker_key(
        &self,
        current: &str,
        new: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerId>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_one(
            &self.conn,
            "rotate_worker_key",
            "UPDATE workers SET api_key = ?1, last_seen_at = ?2 WHERE api_key = ?3 RETURNING id",
            params![new, ts(now), current],
            |row| parse_uuid(&text(row, 0)?),
        )
        .await
    }

    // ── Jobs: reads ─────────────────────────────────────────────────

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_job(&self.conn, id).await
    }

    async fn list_jobs_for_output(&self, output_id: OutputId) -> Result<Vec<Job>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_all(
            &self.conn,
            "list_jobs_for_output",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE target_output_id = ?1 ORDER BY seq"),
            params![output_id.to_string()],
            row_to_job,
        )
        .await
    }

    async fn has_pending_jobs(&self) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM jobs WHERE status = ?1)",
                params![JobStatus::Pending.as_str()],
            )
            .await
            .map_err(query_err("has_pending_jobs"))?;
        match rows.next().await.map_err(query_err("has_pending_jobs"))? {
            Some(row) => Ok(int(&row, 0)? != 0),
            None => Ok(false),
        }
    }

    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_all(
            &self.conn,
            "list_attempts",
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM job_attempts WHERE job_id = ?1 ORDER BY started_at, rowid"
            ),
            params![job_id.to_string()],
            row_to_attempt,
        )
        .await
    }

    async fn list_failures(&self, job_id: Option<JobId>) -> Result<Vec<FailureRecord>, DatabaseError> {
        let _guard = self.lock.lock().await;
        match job_id {
            Some(job_id) => {
                query_all(
                    &self.conn,
                    "list_failures",
                    &format!(
                        "SELECT {FAILURE_COLUMNS} FROM failures WHERE job_id = ?1 ORDER BY detected_at, rowid"
                    ),
                    params![job_id.to_string()],
                    row_to_failure,
                )
                .await
            }
            None => {
                query_all(
                    &self.conn,
                    "list_failures",
                    &format!("SELECT {FAILURE_COLUMNS} FROM failures ORDER BY detected_at, rowid"),
                    (),
                    row_to_failure,
                )
                .await
            }
        }
    }

    // ── Jobs: transitions ───────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("insert_job").await?;
        let result = insert_job_in(&tx, job).await;
        finish(tx, "insert_job", result).await?;
        debug!(job_id = %job.id, output_id = %job.target_output_id, "Job inserted");
        Ok(())
    }

    async fn claim_next_job(
        &self,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
        gate: &dyn ClaimGate,
    ) -> Result<Option<Job>, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("claim_next_job").await?;
        let result = claim_in(&tx, worker_id, janitor_id, now, gate).await;
        finish(tx, "claim_next_job", result).await
    }

    async fn heartbeat_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("heartbeat_job").await?;
        let result = heartbeat_in(&tx, job_id, worker_id, janitor_id, now).await;
        finish(tx, "heartbeat_job", result).await
    }

    async fn append_output(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: &str,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("append_output").await?;
        let result = async {
            let job = heartbeat_in(&tx, job_id, worker_id, janitor_id, now).await?;
            append_content(&tx, "append_output", job.target_output_id, chunk, now).await?;
            Ok::<_, DispatchError>(job)
        }
        .await;
        finish(tx, "append_output", result).await
    }

    async fn finalize_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: &str,
        outcome: Outcome,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Finalized, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("finalize_job").await?;
        let result = finalize_in(&tx, job_id, worker_id, chunk, outcome, max_retries, now).await;
        finish(tx, "finalize_job", result).await
    }

    async fn expire_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        janitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("expire_job").await?;
        let result = expire_in(&tx, job_id, worker_id, janitor_id, now).await;
        finish(tx, "expire_job", result).await
    }

    async fn reclaim_dead_jobs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reclaimed>, DispatchError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("reclaim_dead_jobs").await?;
        let result = reclaim_in(&tx, cutoff, now, limit).await;
        finish(tx, "reclaim_dead_jobs", result).await
    }

    // ── Rate limits ─────────────────────────────────────────────────

    async fn get_rate_limit(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<RateLimitState>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_rate_limit(&self.conn, name, key).await
    }

    async fn consume_rate_limit(
        &self,
        name: &str,
        key: &str,
        config: &LimiterConfig,
        cost: u32,
        reserve: bool,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("consume_rate_limit").await?;
        let result = consume_rate_limit_in(&tx, name, key, config, cost, reserve, now).await;
        finish(tx, "consume_rate_limit", result).await
    }

    async fn reset_rate_limit(&self, name: &str, key: &str) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM rate_limits WHERE name = ?1 AND key = ?2",
                params![name, key],
            )
            .await
            .map_err(query_err("reset_rate_limit"))?;
        Ok(deleted > 0)
    }
}
