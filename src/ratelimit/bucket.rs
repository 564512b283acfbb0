//! Refill arithmetic for the two limiter kinds.
//!
//! Nothing ticks in the background: available units are derived from the
//! stored value and the time elapsed since it was written.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{LimiterConfig, LimiterKind};

/// Persisted per-key limiter state.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    /// Available units. Negative while a reservation is outstanding.
    pub value: f64,
    /// Token bucket: time of the last write. Sliding counter: start of the current window.
    pub updated_at: DateTime<Utc>,
}

/// Answer to a check or consume call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The units were taken ahead of time; the caller may act at `retry_at`.
    pub reserved: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reserved: false,
            retry_at: None,
        }
    }

    fn rejected(retry_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            reserved: false,
            retry_at: Some(retry_at),
        }
    }

    fn reserved(retry_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            reserved: true,
            retry_at: Some(retry_at),
        }
    }
}

/// Decision plus the state to persist, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: RateLimitDecision,
    /// `Some` when units were consumed or reserved.
    pub next_state: Option<RateLimitState>,
}

/// Evaluate taking `cost` units at `now`.
///
/// `reserve` asks for a reservation when units are short; it only succeeds
/// when the limiter allows reservations and the deficit fits `max_reserved`.
pub fn evaluate(
    config: &LimiterConfig,
    stored: Option<&RateLimitState>,
    now: DateTime<Utc>,
    cost: u32,
    reserve: bool,
) -> Evaluation {
    let refilled = refill(config, stored, now);
    let remaining = refilled.value - f64::from(cost);

    if remaining >= 0.0 {
        return Evaluation {
            decision: RateLimitDecision::allowed(),
            next_state: Some(RateLimitState {
                value: remaining,
                updated_at: refilled.updated_at,
            }),
        };
    }

    let deficit = -remaining;
    let retry_at = ready_at(config, &refilled, deficit, now);
    let reservable = config
        .max_reserved
        .is_some_and(|max| deficit <= f64::from(max));

    if reserve && reservable {
        Evaluation {
            decision: RateLimitDecision::reserved(retry_at),
            next_state: Some(RateLimitState {
                value: remaining,
                updated_at: refilled.updated_at,
            }),
        }
    } else {
        Evaluation {
            decision: RateLimitDecision::rejected(retry_at),
            next_state: None,
        }
    }
}

/// Bring the stored state forward to `now`.
fn refill(
    config: &LimiterConfig,
    stored: Option<&RateLimitState>,
    now: DateTime<Utc>,
) -> RateLimitState {
    let capacity = f64::from(config.capacity());
    let Some(stored) = stored else {
        return RateLimitState {
            value: capacity,
            updated_at: now,
        };
    };

    let elapsed_ms = (now - stored.updated_at).num_milliseconds().max(0) as f64;
    let period_ms = period_ms(config);
    let rate = f64::from(config.rate);

    match config.kind {
        LimiterKind::TokenBucket => RateLimitState {
            value: (stored.value + elapsed_ms * rate / period_ms).min(capacity),
            updated_at: now,
        },
        LimiterKind::SlidingCounter => {
            let windows = (elapsed_ms / period_ms).floor();
            RateLimitState {
                value: (stored.value + windows * rate).min(capacity),
                updated_at: stored.updated_at
                    + Duration::milliseconds((windows * period_ms) as i64),
            }
        }
    }
}

/// When `deficit` units will have been refilled. Always strictly after `now`.
fn ready_at(
    config: &LimiterConfig,
    refilled: &RateLimitState,
    deficit: f64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let period_ms = period_ms(config);
    let rate = f64::from(config.rate);

    let at = match config.kind {
        LimiterKind::TokenBucket => {
            // Shave float noise so an exact deficit does not round up a whole millisecond.
            let wait_ms = (deficit * period_ms / rate - 1e-6).ceil() as i64;
            now + Duration::milliseconds(wait_ms.max(1))
        }
        LimiterKind::SlidingCounter => {
            let windows = (deficit / rate - 1e-9).ceil().max(1.0);
            refilled.updated_at + Duration::milliseconds((windows * period_ms) as i64)
        }
    };
    at.max(now + Duration::milliseconds(1))
}

fn period_ms(config: &LimiterConfig) -> f64 {
    (config.period.as_millis() as f64).max(1.0)
}
