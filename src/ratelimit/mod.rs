//! Named, keyed rate limiters backed by the store.

pub mod bucket;
pub mod limiter;

pub use bucket::{RateLimitDecision, RateLimitState};
pub use limiter::RateLimiter;

/// Enqueueing a completion job, keyed by the calling principal.
pub const ENQUEUE_JOB: &str = "enqueue_job";
/// Starting a new thread.
pub const START_THREAD: &str = "start_thread";
/// Joining an existing thread.
pub const JOIN_THREAD: &str = "join_thread";
/// Registering a new worker.
pub const REGISTER_WORKER: &str = "register_worker";
