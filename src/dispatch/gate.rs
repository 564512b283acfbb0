//! Anti-starvation gate for repeat claims.

use rand::Rng;

use crate::jobs::{Job, WorkerId};

/// Decides whether a worker that already failed a job's target may claim it again.
///
/// Consulted only for such repeats; first attempts are always granted. A
/// refusal makes the claim skip to the next pending job.
pub trait ClaimGate: Send + Sync {
    fn admit_repeat(&self, job: &Job, worker_id: WorkerId) -> bool;
}

/// Grants a repeat with a fixed probability.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilisticGate {
    probability: f64,
}

impl ProbabilisticGate {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl ClaimGate for ProbabilisticGate {
    fn admit_repeat(&self, _job: &Job, _worker_id: WorkerId) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }
}

/// Always lets a worker retry its own failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAdmit;

impl ClaimGate for AlwaysAdmit {
    fn admit_repeat(&self, _job: &Job, _worker_id: WorkerId) -> bool {
        true
    }
}

/// Never hands a worker a target it already failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAdmit;

impl ClaimGate for NeverAdmit {
    fn admit_repeat(&self, _job: &Job, _worker_id: WorkerId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn probabilistic_gate_extremes() {
        let job = Job::new(Uuid::new_v4(), false, Utc::now());
        let worker = Uuid::new_v4();
        let never = ProbabilisticGate::new(0.0);
        let always = ProbabilisticGate::new(1.0);
        for _ in 0..100 {
            assert!(!never.admit_repeat(&job, worker));
            assert!(always.admit_repeat(&job, worker));
        }
    }

    #[test]
    fn probabilistic_gate_clamps() {
        let job = Job::new(Uuid::new_v4(), false, Utc::now());
        assert!(ProbabilisticGate::new(7.0).admit_repeat(&job, Uuid::new_v4()));
        assert!(!ProbabilisticGate::new(-1.0).admit_repeat(&job, Uuid::new_v4()));
    }

    #[test]
    fn probabilistic_gate_rate_is_roughly_right() {
        let job = Job::new(Uuid::new_v4(), false, Utc::now());
        let gate = ProbabilisticGate::new(0.1);
        let admitted = (0..10_000)
            .filter(|_| gate.admit_repeat(&job, Uuid::new_v4()))
            .count();
        assert!((500..1500).contains(&admitted), "admitted {admitted}");
    }
}
