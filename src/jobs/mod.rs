//! Jobs, workers, and the output records they fill in.

pub mod model;

pub use model::{
    AttemptOutcome, AuthorRole, ClaimedJob, Disposition, FailureRecord, Job, JobAttempt, JobId,
    JobStatus, Outcome, OutputId, OutputRecord, OutputState, Registration, SweepReport, UnknownTag,
    Worker, WorkerId,
};
