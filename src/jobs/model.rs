//! Job, worker, and output data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;
pub type WorkerId = Uuid;
pub type OutputId = Uuid;

/// Error returned when a stored enum tag is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(UnknownTag { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    TimedOut,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    InProgress => "in_progress",
    Success => "success",
    Failed => "failed",
    TimedOut => "timed_out",
});

impl JobStatus {
    /// No further transitions happen out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::TimedOut)
    }
}

/// One dispatchable unit of completion work tied to an output record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target_output_id: OutputId,
    pub wants_streaming: bool,
    pub status: JobStatus,
    pub last_update_at: DateTime<Utc>,
    /// Set iff `status == InProgress`.
    pub claimed_by: Option<WorkerId>,
    pub retry_count: u32,
    /// Handle of the currently armed deadline timer.
    pub janitor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(target_output_id: OutputId, wants_streaming: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_output_id,
            wants_streaming,
            status: JobStatus::Pending,
            last_update_at: now,
            claimed_by: None,
            retry_count: 0,
            janitor_id: None,
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_owned_by(&self, worker_id: WorkerId) -> bool {
        self.status == JobStatus::InProgress && self.claimed_by == Some(worker_id)
    }
}

/// What a worker receives when it claims a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub target_output_id: OutputId,
    pub wants_streaming: bool,
    pub retry_count: u32,
}

impl From<&Job> for ClaimedJob {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            target_output_id: job.target_output_id,
            wants_streaming: job.wants_streaming,
            retry_count: job.retry_count,
        }
    }
}

/// Outcome reported with a final submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

/// What happened to a job on its final submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Failure with retries left; the job is pending again.
    Requeued { retry_count: u32 },
    /// Failure with no retries left; the job is terminally failed.
    Exhausted { attempts: u32 },
}

/// A registered execution agent.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub api_key: SecretString,
    pub display_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Returned once at registration; the only time the secret leaves the server
/// outside of a rotation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub worker_id: WorkerId,
    pub api_key: SecretString,
}

/// Authorship of an output record. Only assistant outputs are job-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    System,
    User,
    Assistant,
}

string_enum!(AuthorRole, "author role", {
    System => "system",
    User => "user",
    Assistant => "assistant",
});

/// Generation state of an output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    Generating,
    Success,
    Failed,
    TimedOut,
}

string_enum!(OutputState, "output state", {
    Generating => "generating",
    Success => "success",
    Failed => "failed",
    TimedOut => "timed_out",
});

/// The message a job fills in. Owned by the thread layer; this crate only
/// appends to `content` and moves `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: OutputId,
    pub role: AuthorRole,
    pub content: String,
    pub state: OutputState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutputRecord {
    /// A fresh record. Assistant outputs start `generating`, others are already done.
    pub fn new(role: AuthorRole, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        let state = match role {
            AuthorRole::Assistant => OutputState::Generating,
            AuthorRole::System | AuthorRole::User => OutputState::Success,
        };
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Audit entry written when the sweep reclaims a job from a silent worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub detected_at: DateTime<Utc>,
}

/// How a single claim of a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Running,
    Success,
    Failed,
    TimedOut,
    /// Reclaimed by the sweep.
    Abandoned,
}

string_enum!(AttemptOutcome, "attempt outcome", {
    Running => "running",
    Success => "success",
    Failed => "failed",
    TimedOut => "timed_out",
    Abandoned => "abandoned",
});

/// History of one claim, used to avoid handing a worker the same failing target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: Uuid,
    pub job_id: JobId,
    pub target_output_id: OutputId,
    pub worker_id: WorkerId,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Result of one sweep run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub reclaimed: Vec<FailureRecord>,
}

impl SweepReport {
    pub fn len(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_tags() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert!("inProgress".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
    }

    #[test]
    fn new_job_is_unclaimed_pending() {
        let now = Utc::now();
        let job = Job::new(Uuid::new_v4(), true, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_update_at, now);
        assert!(!job.is_owned_by(Uuid::new_v4()));
    }

    #[test]
    fn assistant_outputs_start_generating() {
        let now = Utc::now();
        assert_eq!(
            OutputRecord::new(AuthorRole::Assistant, "", now).state,
            OutputState::Generating
        );
        assert_eq!(
            OutputRecord::new(AuthorRole::User, "hi", now).state,
            OutputState::Success
        );
    }

    #[test]
    fn outcome_serde() {
        let json = serde_json::to_string(&Outcome::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let back: Outcome = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(back, Outcome::Success);
    }

    #[test]
    fn worker_debug_redacts_key() {
        let worker = Worker {
            id: Uuid::new_v4(),
            api_key: SecretString::from("super-secret-key"),
            display_name: None,
            last_seen_at: Utc::now(),
            created_at: Utc::now(),
        };
        assert!(!format!("{worker:?}").contains("super-secret-key"));
    }
}
