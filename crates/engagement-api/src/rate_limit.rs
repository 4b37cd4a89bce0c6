use std::time::Duration;

use crate::config::GateConfig;
use crate::error::FastStoreError;
use crate::fast_store::FastStore;

/// Fixed-window request limiter keyed by route class and caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiter {
    route_class: String,
    limit: u32,
    window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: u32,
    /// Milliseconds until the window resets; set only on rejection.
    pub retry_after_ms: Option<u64>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(route_class: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self { route_class: route_class.into(), limit, window }
    }

    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.route_class.clone(), config.rate_limit, config.rate_window())
    }

    #[must_use]
    pub fn actor_key(&self, actor_id: &str) -> String {
        format!("rl:{}:actor:{actor_id}", self.route_class)
    }

    #[must_use]
    pub fn address_key(&self, client_ip: &str) -> String {
        format!("rl:{}:ip:{client_ip}", self.route_class)
    }

    /// Count one request against the actor and, when known, the client address. The
    /// request is rejected when either counter is at the limit.
    ///
    /// The actor counter is checked first; a request it rejects never touches the
    /// address counter.
    ///
    /// # Errors
    /// Returns the fast store error when a counter cannot be read or incremented.
    pub async fn check<S: FastStore>(
        &self,
        store: &S,
        actor_id: &str,
        client_ip: Option<&str>,
    ) -> Result<RateDecision, FastStoreError> {
        let by_actor = self.count(store, &self.actor_key(actor_id)).await?;
        match client_ip {
            Some(ip) if by_actor.allowed => self.count(store, &self.address_key(ip)).await,
            _ => Ok(by_actor),
        }
    }

    /// Count one request against a single counter. Rejected requests leave it unchanged.
    async fn count<S: FastStore>(&self, store: &S, key: &str) -> Result<RateDecision, FastStoreError> {
        let state = store.increment_bounded(key, self.limit, self.window).await?;
        let retry_after_ms = if state.allowed {
            None
        } else {
            Some(u64::try_from(state.reset_after.as_millis()).unwrap_or(u64::MAX))
        };
        Ok(RateDecision { allowed: state.allowed, count: state.count, retry_after_ms })
    }
}
