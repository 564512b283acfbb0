//! End-to-end dispatch scenarios against an in-memory store and a manual clock.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use llm_dispatch::clock::{Clock, ManualClock};
use llm_dispatch::config::{DispatchConfig, LimiterConfig, RateLimitsConfig};
use llm_dispatch::dispatch::{AlwaysAdmit, Dispatcher};
use llm_dispatch::error::DispatchError;
use llm_dispatch::jobs::{AttemptOutcome, AuthorRole, JobStatus, Outcome, OutputId, OutputState};
use llm_dispatch::ratelimit::{ENQUEUE_JOB, REGISTER_WORKER, RateLimiter};
use llm_dispatch::store::{LibSqlBackend, Store};

struct Coordinator {
    dispatcher: Dispatcher,
    clock: Arc<ManualClock>,
}

async fn coordinator() -> Coordinator {
    let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock = Arc::new(ManualClock::default());
    let config = DispatchConfig {
        rate_limits: RateLimitsConfig::default()
            .with(ENQUEUE_JOB, LimiterConfig::token_bucket(100, Duration::from_secs(1)))
            .with(REGISTER_WORKER, LimiterConfig::token_bucket(100, Duration::from_secs(1))),
        ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::with_parts(store, config, clock.clone(), Arc::new(AlwaysAdmit))
        .await
        .unwrap();
    Coordinator { dispatcher, clock }
}

impl Coordinator {
    async fn assistant_job(&self, streaming: bool) -> OutputId {
        let output = self
            .dispatcher
            .create_output(AuthorRole::Assistant, "")
            .await
            .unwrap();
        self.dispatcher
            .enqueue("producer", output.id, streaming)
            .await
            .unwrap();
        output.id
    }

    async fn worker(&self, name: &str) -> SecretString {
        self.dispatcher
            .register("ops", Some(name.to_string()))
            .await
            .unwrap()
            .api_key
    }
}

#[tokio::test]
async fn streamed_chunks_assemble_into_output() {
    let c = coordinator().await;
    let output_id = c.assistant_job(true).await;
    let key = c.worker("w1").await;

    let job = c.dispatcher.claim(&key).await.unwrap().unwrap();
    c.dispatcher.submit_partial(&key, job.job_id, "Hello").await.unwrap();
    assert_eq!(
        c.dispatcher.get_output(output_id).await.unwrap().content,
        "Hello"
    );
    c.dispatcher.submit_partial(&key, job.job_id, " world").await.unwrap();
    let next = c
        .dispatcher
        .submit_final(&key, job.job_id, "!", Outcome::Success)
        .await
        .unwrap();
    assert!(next.is_none());

    let output = c.dispatcher.get_output(output_id).await.unwrap();
    assert_eq!(output.content, "Hello world!");
    assert_eq!(output.state, OutputState::Success);

    let job = c.dispatcher.get_job(job.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.claimed_by.is_none());
    assert!(job.ended_at.is_some());
}

#[tokio::test]
async fn silent_worker_is_reclaimed_by_sweep() {
    let c = coordinator().await;
    let output_id = c.assistant_job(true).await;
    let silent = c.worker("silent").await;

    let job = c.dispatcher.claim(&silent).await.unwrap().unwrap();
    c.dispatcher
        .submit_partial(&silent, job.job_id, "half an ans")
        .await
        .unwrap();

    c.clock.advance(Duration::from_secs(31));
    let report = c.dispatcher.sweep().await.unwrap();
    assert_eq!(report.len(), 1);

    let failures = c.dispatcher.failures(Some(job.job_id)).await.unwrap();
    assert_eq!(failures.len(), 1);
    let lag = c.clock.now() - failures[0].detected_at;
    assert!(lag.num_milliseconds().abs() < 1);

    let reclaimed = c.dispatcher.get_job(job.job_id).await.unwrap();
    assert_eq!(reclaimed.status, JobStatus::Pending);
    assert!(reclaimed.claimed_by.is_none());
    assert_eq!(
        c.dispatcher.get_output(output_id).await.unwrap().content,
        "half an ans",
        "committed partial content survives a reclaim"
    );

    // Another worker picks it up and finishes it.
    let rescuer = c.worker("rescuer").await;
    let again = c.dispatcher.claim(&rescuer).await.unwrap().unwrap();
    assert_eq!(again.job_id, job.job_id);
    c.dispatcher
        .submit_final(&rescuer, job.job_id, "wer.", Outcome::Success)
        .await
        .unwrap();
    assert_eq!(
        c.dispatcher.get_output(output_id).await.unwrap().content,
        "half an answer."
    );

    let outcomes: Vec<_> = c
        .dispatcher
        .attempts(job.job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Abandoned, AttemptOutcome::Success]);
}

#[tokio::test]
async fn repeated_failures_end_in_failed_output() {
    let c = coordinator().await;
    let output_id = c.assistant_job(false).await;
    let key = c.worker("flaky").await;
    let max_retries = c.dispatcher.config().max_retries;

    let mut job = c.dispatcher.claim(&key).await.unwrap();
    let mut failures = 0;
    while let Some(claimed) = job {
        failures += 1;
        job = c
            .dispatcher
            .submit_final(&key, claimed.job_id, "model overloaded", Outcome::Failed)
            .await
            .unwrap();
    }
    assert_eq!(failures, max_retries + 1);

    let output = c.dispatcher.get_output(output_id).await.unwrap();
    assert_eq!(output.state, OutputState::Failed);
    assert_eq!(
        output.content,
        "model overloaded".repeat(max_retries as usize + 1)
    );
    assert!(!c.dispatcher.is_there_work().await.unwrap());
}

#[tokio::test]
async fn fourth_call_within_window_is_rejected() {
    let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock = Arc::new(ManualClock::default());
    let limits = RateLimitsConfig::default().with(
        "probe",
        LimiterConfig::token_bucket(1, Duration::from_secs(30)).with_capacity(3),
    );
    let limiter = RateLimiter::new(store, limits, clock.clone());

    for _ in 0..3 {
        limiter.limit("probe", "alice").await.unwrap();
    }
    let now = clock.now();
    let Err(DispatchError::RateLimited { retry_at, .. }) = limiter.limit("probe", "alice").await
    else {
        panic!("fourth call must be limited");
    };
    let wait = (retry_at - now).num_milliseconds();
    assert!((29_900..=30_100).contains(&wait), "retry_at {wait}ms away");

    // Another principal has its own budget.
    limiter.limit("probe", "bob").await.unwrap();

    clock.advance(Duration::from_secs(30));
    limiter.limit("probe", "alice").await.unwrap();
}
