//! View-dedupe gate.
//!
//! Checks run in a fixed order and stop at the first rejection: bot filter, rate limit,
//! self-view, durable duplicate check, fast-store lock, then the write. The durable
//! check is authoritative; the lock only narrows the race between concurrent requests.

use std::sync::Arc;

use engagement_core::{ActorId, EngagementEvent, EntityId, EventId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::bot::BotFilter;
use crate::config::GateConfig;
use crate::error::{ApiError, ApiResult};
use crate::fast_store::FastStore;
use crate::rate_limit::RateLimiter;
use crate::store::SignalStoreHandle;

/// Request context the gate needs beyond the ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestMetadata {
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    /// Owner hint from a trusted in-process caller. It can only add a self-view
    /// rejection; the owner registry is always consulted as well.
    pub content_owner: Option<ActorId>,
}

impl RequestMetadata {
    /// Client address with surrounding whitespace removed, if any is left.
    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ViewReason {
    #[serde(rename = "bot")]
    Bot,
    #[serde(rename = "rate-limited")]
    RateLimited,
    #[serde(rename = "self")]
    SelfView,
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "ok")]
    Ok,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewDecision {
    pub accepted: bool,
    pub reason: ViewReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Terminal state of one gate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    BotRejected,
    RateRejected { retry_after_ms: u64 },
    SelfView,
    DuplicateDb,
    DuplicateLock,
    Accepted { event_id: EventId },
}

impl GateOutcome {
    #[must_use]
    pub fn decision(self) -> ViewDecision {
        let (accepted, reason, retry_after_ms) = match self {
            Self::BotRejected => (false, ViewReason::Bot, None),
            Self::RateRejected { retry_after_ms } => {
                (false, ViewReason::RateLimited, Some(retry_after_ms))
            }
            Self::SelfView => (false, ViewReason::SelfView, None),
            Self::DuplicateDb | Self::DuplicateLock => (false, ViewReason::Duplicate, None),
            Self::Accepted { .. } => (true, ViewReason::Ok, None),
        };
        ViewDecision { accepted, reason, retry_after_ms }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BotRejected => "bot_rejected",
            Self::RateRejected { .. } => "rate_rejected",
            Self::SelfView => "self_view",
            Self::DuplicateDb => "duplicate_db",
            Self::DuplicateLock => "duplicate_lock",
            Self::Accepted { .. } => "accepted",
        }
    }
}

pub struct DedupeGate<S> {
    store: SignalStoreHandle,
    fast_store: Arc<S>,
    bot_filter: BotFilter,
    rate_limiter: RateLimiter,
    config: GateConfig,
}

impl<S: FastStore> DedupeGate<S> {
    #[must_use]
    pub fn new(
        store: SignalStoreHandle,
        fast_store: Arc<S>,
        bot_filter: BotFilter,
        config: GateConfig,
    ) -> Self {
        let rate_limiter = RateLimiter::from_config(&config);
        Self { store, fast_store, bot_filter, rate_limiter, config }
    }

    #[must_use]
    pub fn lock_key(entity_id: &EntityId, actor_id: &ActorId) -> String {
        format!("view:{entity_id}:{actor_id}")
    }

    /// Count a view at most once per actor, entity, and dedupe window.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for blank ids, [`ApiError::LockTimeout`] when the
    /// lock cannot be taken in time, and [`ApiError::StoreUnavailable`] when the durable
    /// check or the write fails. All but validation are retryable.
    pub async fn record_view(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        metadata: &RequestMetadata,
    ) -> ApiResult<ViewDecision> {
        let outcome = self.evaluate_view(entity_id, actor_id, metadata).await?;
        Ok(outcome.decision())
    }

    /// Run the gate and return the detailed terminal state.
    ///
    /// # Errors
    /// Same as [`Self::record_view`].
    pub async fn evaluate_view(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        metadata: &RequestMetadata,
    ) -> ApiResult<GateOutcome> {
        if entity_id.as_str().trim().is_empty() || actor_id.as_str().trim().is_empty() {
            return Err(ApiError::Validation(
                "entity_id and actor_id MUST be non-empty".to_string(),
            ));
        }

        let outcome = self.run_checks(entity_id, actor_id, metadata).await?;
        debug!(
            entity_id = %entity_id,
            actor_id = %actor_id,
            outcome = outcome.as_str(),
            "view gate decision"
        );
        Ok(outcome)
    }

    async fn run_checks(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        metadata: &RequestMetadata,
    ) -> ApiResult<GateOutcome> {
        if self.bot_filter.is_likely_bot(metadata.user_agent.as_deref()) {
            return Ok(GateOutcome::BotRejected);
        }

        let rate = self
            .rate_limiter
            .check(self.fast_store.as_ref(), actor_id.as_str(), metadata.client_ip())
            .await?;
        if !rate.allowed {
            return Ok(GateOutcome::RateRejected {
                retry_after_ms: rate.retry_after_ms.unwrap_or(self.config.rate_window_ms),
            });
        }

        if self.is_owner(entity_id, actor_id, metadata).await? {
            return Ok(GateOutcome::SelfView);
        }

        let now = OffsetDateTime::now_utc();
        let since = now - self.config.dedupe_window();
        if self.has_recent_view(entity_id, actor_id, since).await? {
            return Ok(GateOutcome::DuplicateDb);
        }

        let key = Self::lock_key(entity_id, actor_id);
        let acquire = self.fast_store.set_if_absent(&key, self.config.dedupe_window());
        let acquired = match tokio::time::timeout(self.config.lock_timeout(), acquire).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(key = %key, "dedupe lock acquisition timed out; view not recorded");
                return Err(ApiError::LockTimeout {
                    key: key.clone(),
                    timeout_ms: self.config.lock_timeout_ms,
                });
            }
        };
        if !acquired {
            return Ok(GateOutcome::DuplicateLock);
        }

        // The lock stays held on failure; it expires with the dedupe window.
        let event = EngagementEvent::view(entity_id.clone(), actor_id.clone(), now);
        let event_id = event.event_id;
        self.store
            .with_primary(move |store| store.append_event(&event))
            .await
            .map_err(|err| {
                warn!(key = %key, error = %err, "view write failed after lock acquisition");
                ApiError::store(&err)
            })?;

        Ok(GateOutcome::Accepted { event_id })
    }

    async fn is_owner(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        metadata: &RequestMetadata,
    ) -> ApiResult<bool> {
        if metadata.content_owner.as_ref() == Some(actor_id) {
            return Ok(true);
        }

        let lookup_id = entity_id.clone();
        let owner = match self.store.with_primary(move |store| store.owner_of(&lookup_id)).await {
            Ok(owner) => owner,
            Err(err) => {
                warn!(entity_id = %entity_id, error = %err, "owner lookup failed; retrying on fresh connection");
                let lookup_id = entity_id.clone();
                self.store
                    .with_fresh(move |store| store.owner_of(&lookup_id))
                    .await
                    .map_err(|err| ApiError::store(&err))?
            }
        };
        Ok(owner.as_ref() == Some(actor_id))
    }

    async fn has_recent_view(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        since: OffsetDateTime,
    ) -> ApiResult<bool> {
        let (entity, actor) = (entity_id.clone(), actor_id.clone());
        match self
            .store
            .with_primary(move |store| store.has_recent_view(&entity, &actor, since))
            .await
        {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(
                    entity_id = %entity_id,
                    actor_id = %actor_id,
                    error = %err,
                    "durable view check failed; falling back to raw query"
                );
                let (entity, actor) = (entity_id.clone(), actor_id.clone());
                self.store
                    .with_fresh(move |store| store.has_recent_view_raw(&entity, &actor, since))
                    .await
                    .map_err(|err| ApiError::store(&err))
            }
        }
    }
}
