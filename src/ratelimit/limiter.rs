//! Store-backed limiter: named configs, per-key state.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitsConfig;
use crate::error::{ConfigError, DispatchError};
use crate::ratelimit::bucket::{self, RateLimitDecision};
use crate::store::Store;

pub struct RateLimiter {
    store: Arc<dyn Store>,
    config: RateLimitsConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, config: RateLimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Would `cost` units be available right now? Consumes nothing.
    pub async fn check(
        &self,
        name: &str,
        key: &str,
        cost: u32,
    ) -> Result<RateLimitDecision, DispatchError> {
        let config = self.config.get(name)?;
        check_cost(name, cost, config.capacity())?;
        let stored = self.store.get_rate_limit(name, key).await?;
        let eval = bucket::evaluate(config, stored.as_ref(), self.clock.now(), cost, false);
        Ok(eval.decision)
    }

    /// Take `cost` units if available.
    pub async fn consume(
        &self,
        name: &str,
        key: &str,
        cost: u32,
    ) -> Result<RateLimitDecision, DispatchError> {
        self.take(name, key, cost, false).await
    }

    /// Take `cost` units, reserving them ahead of time when short.
    pub async fn reserve(
        &self,
        name: &str,
        key: &str,
        cost: u32,
    ) -> Result<RateLimitDecision, DispatchError> {
        self.take(name, key, cost, true).await
    }

    /// Consume one unit or fail with `RateLimited`.
    pub async fn limit(&self, name: &str, key: &str) -> Result<(), DispatchError> {
        let decision = self.consume(name, key, 1).await?;
        if decision.allowed {
            return Ok(());
        }
        debug!(limiter = name, key, retry_at = ?decision.retry_at, "Rate limited");
        Err(DispatchError::RateLimited {
            name: name.to_string(),
            retry_at: decision.retry_at.unwrap_or_else(|| self.clock.now()),
        })
    }

    /// Forget a key's state; it starts full again.
    pub async fn reset(&self, name: &str, key: &str) -> Result<bool, DispatchError> {
        self.config.get(name)?;
        Ok(self.store.reset_rate_limit(name, key).await?)
    }

    async fn take(
        &self,
        name: &str,
        key: &str,
        cost: u32,
        reserve: bool,
    ) -> Result<RateLimitDecision, DispatchError> {
        let config = self.config.get(name)?;
        check_cost(name, cost, config.capacity())?;
        let decision = self
            .store
            .consume_rate_limit(name, key, config, cost, reserve, self.clock.now())
            .await?;
        Ok(decision)
    }
}

/// A cost above capacity could never be satisfied.
fn check_cost(name: &str, cost: u32, capacity: u32) -> Result<(), ConfigError> {
    if cost == 0 || cost > capacity {
        return Err(ConfigError::InvalidValue {
            key: format!("rate_limits.{name}.cost"),
            message: format!("{cost} is not within 1..={capacity}"),
        });
    }
    Ok(())
}
