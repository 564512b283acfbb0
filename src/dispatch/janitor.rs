//! Per-job deadline timers.
//!
//! Each claimed job has at most one armed timer, identified by the janitor id
//! stored on the job row. Arming a new timer aborts the previous one; a timer
//! that fires clears its own entry before running its action.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::jobs::JobId;

struct Armed {
    janitor_id: Uuid,
    handle: AbortHandle,
}

type Timers = Arc<Mutex<HashMap<JobId, Armed>>>;

#[derive(Default)]
pub struct JanitorRegistry {
    timers: Timers,
}

impl JanitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` after `delay` unless re-armed or cancelled first.
    pub fn arm<F>(&self, job_id: JobId, janitor_id: Uuid, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        let mut guard = lock(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = lock(&timers);
                if timers
                    .get(&job_id)
                    .is_some_and(|armed| armed.janitor_id == janitor_id)
                {
                    timers.remove(&job_id);
                }
            }
            on_fire.await;
        });
        let armed = Armed {
            janitor_id,
            handle: task.abort_handle(),
        };
        if let Some(previous) = guard.insert(job_id, armed) {
            previous.handle.abort();
        }
    }

    /// Abort the job's timer only if it is still the one armed as `janitor_id`.
    pub fn cancel_if(&self, job_id: JobId, janitor_id: Uuid) -> bool {
        let mut timers = lock(&self.timers);
        if !timers
            .get(&job_id)
            .is_some_and(|armed| armed.janitor_id == janitor_id)
        {
            return false;
        }
        match timers.remove(&job_id) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Janitor id of the job's armed timer.
    pub fn armed(&self, job_id: JobId) -> Option<Uuid> {
        lock(&self.timers).get(&job_id).map(|armed| armed.janitor_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for JanitorRegistry {
    fn drop(&mut self) {
        for (_, armed) in lock(&self.timers).drain() {
            armed.handle.abort();
        }
    }
}

fn lock(timers: &Timers) -> std::sync::MutexGuard<'_, HashMap<JobId, Armed>> {
    timers.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        let make = move || {
            let fired = Arc::clone(&handle);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (fired, make)
    }

    #[tokio::test]
    async fn fires_after_delay_and_clears_entry() {
        let janitors = JanitorRegistry::new();
        let (fired, make) = counter();
        let job = Uuid::new_v4();

        janitors.arm(job, Uuid::new_v4(), Duration::from_millis(20), make());
        assert_eq!(janitors.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(janitors.is_empty());
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let janitors = JanitorRegistry::new();
        let (fired, make) = counter();
        let job = Uuid::new_v4();

        janitors.arm(job, Uuid::new_v4(), Duration::from_millis(30), make());
        let second = Uuid::new_v4();
        janitors.arm(job, second, Duration::from_millis(60), make());
        assert_eq!(janitors.armed(job), Some(second));

        tokio::time::sleep(Duration::from_millis(45)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "first timer must be aborted");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let janitors = JanitorRegistry::new();
        let (fired, make) = counter();
        let job = Uuid::new_v4();
        let janitor = Uuid::new_v4();

        janitors.arm(job, janitor, Duration::from_millis(20), make());
        assert!(janitors.cancel_if(job, janitor));
        assert!(!janitors.cancel_if(job, janitor));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_if_leaves_newer_timer_armed() {
        let janitors = JanitorRegistry::new();
        let (fired, make) = counter();
        let job = Uuid::new_v4();

        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        janitors.arm(job, new, Duration::from_millis(20), make());
        assert!(!janitors.cancel_if(job, old));
        assert_eq!(janitors.armed(job), Some(new));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        janitors.arm(job, new, Duration::from_millis(20), make());
        assert!(janitors.cancel_if(job, new));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_aborts_outstanding_timers() {
        let (fired, make) = counter();
        {
            let janitors = JanitorRegistry::new();
            janitors.arm(Uuid::new_v4(), Uuid::new_v4(), Duration::from_millis(20), make());
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
