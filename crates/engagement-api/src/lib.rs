use std::path::{Path, PathBuf};
use std::sync::Arc;

use engagement_core::{
    ActorId, EngagementEvent, EntityId, EventId, RankStrategy, RankedEntity, SignalKind,
};
use engagement_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

pub mod bot;
pub mod config;
pub mod error;
pub mod fast_store;
pub mod gate;
pub mod pipeline;
pub mod rate_limit;
pub mod store;

pub use bot::BotFilter;
pub use config::{EngagementConfig, GateConfig, RankCacheConfig};
pub use error::{ApiError, ApiResult, FastStoreError};
pub use fast_store::{FailoverFastStore, FastStore, LocalFastStore, RedisFastStore};
pub use gate::{DedupeGate, GateOutcome, RequestMetadata, ViewDecision, ViewReason};
pub use pipeline::{RankOutcome, RankPipeline, RankSource};
pub use store::SignalStoreHandle;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Rating or comment submitted by the content collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordEventRequest {
    pub entity_id: EntityId,
    pub actor_id: ActorId,
    pub kind: SignalKind,
    /// Rating score; ignored for comments.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

/// Facade over the signal store, the dedupe gate and the rank pipeline.
pub struct EngagementApi<S = FailoverFastStore> {
    config: EngagementConfig,
    store: SignalStoreHandle,
    gate: DedupeGate<S>,
    pipeline: RankPipeline,
}

impl<S: FastStore> EngagementApi<S> {
    /// # Errors
    /// Returns [`ApiError::Config`] for an invalid config and
    /// [`ApiError::StoreUnavailable`] when the database cannot be opened.
    pub fn open(db_path: &Path, config: EngagementConfig, fast_store: Arc<S>) -> ApiResult<Self> {
        config.validate()?;
        let store = SignalStoreHandle::open(db_path)?;
        let gate = DedupeGate::new(
            store.clone(),
            fast_store,
            BotFilter::default(),
            config.gate.clone(),
        );
        let pipeline = RankPipeline::new(store.clone(), config.ranking, config.rank_cache);
        Ok(Self { config, store, gate, pipeline })
    }

    #[must_use]
    pub fn config(&self) -> &EngagementConfig {
        &self.config
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.store.db_path().to_path_buf()
    }

    #[must_use]
    pub fn gate(&self) -> &DedupeGate<S> {
        &self.gate
    }

    #[must_use]
    pub fn pipeline(&self) -> &RankPipeline {
        &self.pipeline
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns [`ApiError::StoreUnavailable`] when the database cannot be queried.
    pub async fn schema_status(&self) -> ApiResult<SchemaStatus> {
        self.store
            .with_fresh(|store| store.schema_status())
            .await
            .map_err(|err| ApiError::store(&err))
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns [`ApiError::StoreUnavailable`] when planning or execution fails.
    pub async fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let result = self
            .store
            .with_fresh(move |store| {
                let before = store.schema_status()?;
                if dry_run {
                    return Ok(MigrateResult {
                        dry_run: true,
                        current_version: before.current_version,
                        target_version: before.target_version,
                        would_apply_versions: before.pending_versions,
                        after_version: None,
                        up_to_date: None,
                    });
                }

                let planned_versions = before.pending_versions;
                store.migrate()?;
                let after = store.schema_status()?;
                Ok(MigrateResult {
                    dry_run: false,
                    current_version: before.current_version,
                    target_version: before.target_version,
                    would_apply_versions: planned_versions,
                    after_version: Some(after.current_version),
                    up_to_date: Some(after.pending_versions.is_empty()),
                })
            })
            .await
            .map_err(|err| ApiError::store(&err))?;

        if !result.dry_run && !result.would_apply_versions.is_empty() {
            info!(versions = ?result.would_apply_versions, "signal store migrated");
        }
        Ok(result)
    }

    /// # Errors
    /// Returns [`ApiError::StoreUnavailable`] when any probe fails.
    pub async fn integrity_check(&self) -> ApiResult<IntegrityReport> {
        self.store
            .with_fresh(|store| store.integrity_check())
            .await
            .map_err(|err| ApiError::store(&err))
    }

    /// Register the owner of an entity so self-engagement can be excluded.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for blank ids and [`ApiError::StoreUnavailable`]
    /// when the write fails.
    pub async fn set_owner(&self, entity_id: EntityId, owner_id: ActorId) -> ApiResult<()> {
        if entity_id.as_str().trim().is_empty() || owner_id.as_str().trim().is_empty() {
            return Err(ApiError::Validation(
                "entity_id and owner_id MUST be non-empty".to_string(),
            ));
        }
        self.store
            .with_primary(move |store| store.set_entity_owner(&entity_id, &owner_id))
            .await
            .map_err(|err| ApiError::store(&err))
    }

    /// Append a rating or comment. Views only enter through [`Self::record_view`].
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for view events, missing or out-of-range ratings,
    /// or blank ids, and [`ApiError::StoreUnavailable`] when the write fails.
    pub async fn record_event(&self, request: RecordEventRequest) -> ApiResult<EventId> {
        let occurred_at = request.occurred_at.unwrap_or_else(OffsetDateTime::now_utc);
        let event = match request.kind {
            SignalKind::View => {
                return Err(ApiError::Validation(
                    "view events MUST be recorded through the dedupe gate".to_string(),
                ));
            }
            SignalKind::Comment => {
                EngagementEvent::comment(request.entity_id, request.actor_id, occurred_at)
            }
            SignalKind::Rating => {
                let Some(score) = request.value else {
                    return Err(ApiError::Validation("rating events MUST carry a value".to_string()));
                };
                EngagementEvent::rating(request.entity_id, request.actor_id, score, occurred_at)
            }
        };
        event.validate()?;

        let event_id = event.event_id;
        self.store
            .with_primary(move |store| store.append_event(&event))
            .await
            .map_err(|err| ApiError::store(&err))?;
        Ok(event_id)
    }

    /// # Errors
    /// See [`DedupeGate::record_view`].
    pub async fn record_view(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        metadata: &RequestMetadata,
    ) -> ApiResult<ViewDecision> {
        self.gate.record_view(entity_id, actor_id, metadata).await
    }

    /// # Errors
    /// See [`RankPipeline::rank`].
    pub async fn rank(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
    ) -> ApiResult<Vec<RankedEntity>> {
        self.pipeline.rank(candidates, strategy).await
    }

    pub async fn rank_or_fallback(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
    ) -> RankOutcome {
        self.pipeline.rank_or_fallback(candidates, strategy).await
    }
}
