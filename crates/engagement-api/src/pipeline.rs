//! Rank pipeline: candidate set -> windowed aggregates -> scorer -> ordered list.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use engagement_core::{
    candidate_set, rank_all_time, rank_trending, CapProfile, EntityId, RankStrategy,
    RankedEntity, RankingConfig, SignalAggregate, SignalComponents, SignalSnapshot,
};
use engagement_store_sqlite::SignalWindow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::RankCacheConfig;
use crate::error::{ApiError, ApiResult};
use crate::store::SignalStoreHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankSource {
    Computed,
    Cached,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankOutcome {
    pub source: RankSource,
    pub strategy: RankStrategy,
    pub entities: Vec<RankedEntity>,
    /// Caps applied by the trending scorer; empty for other sources and strategies.
    pub caps: Vec<CapProfile>,
}

#[derive(Debug, Clone)]
struct CachedRanking {
    entities: Vec<RankedEntity>,
    caps: Vec<CapProfile>,
    stored_at: Instant,
}

/// Bounded in-process store of recent orderings keyed by request digest.
#[derive(Debug)]
pub struct RankCache {
    entries: Mutex<HashMap<String, CachedRanking>>,
    max_entries: usize,
}

impl RankCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), max_entries: max_entries.max(1) }
    }

    /// Stable digest of a strategy and its deduplicated candidate set.
    #[must_use]
    pub fn key(strategy: RankStrategy, candidates: &BTreeSet<EntityId>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(strategy.as_str().as_bytes());
        if let RankStrategy::Trending { window_secs } = strategy {
            hasher.update(window_secs.to_be_bytes());
        }
        for id in candidates {
            hasher.update([0_u8]);
            hasher.update(id.as_str().as_bytes());
        }
        let digest = hasher.finalize();
        format!("rank_{digest:x}")
    }

    fn fresh(&self, key: &str, ttl: Duration) -> Option<CachedRanking> {
        if ttl.is_zero() {
            return None;
        }
        self.entries.lock().get(key).filter(|entry| entry.stored_at.elapsed() < ttl).cloned()
    }

    fn last_good(&self, key: &str) -> Option<CachedRanking> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: String, entities: Vec<RankedEntity>, caps: Vec<CapProfile>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, CachedRanking { entities, caps, stored_at: Instant::now() });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct RankPipeline {
    store: SignalStoreHandle,
    config: RankingConfig,
    cache: RankCache,
    cache_ttl: Duration,
}

impl RankPipeline {
    #[must_use]
    pub fn new(store: SignalStoreHandle, config: RankingConfig, cache: RankCacheConfig) -> Self {
        Self {
            store,
            config,
            cache: RankCache::new(cache.max_entries),
            cache_ttl: Duration::from_millis(cache.ttl_ms),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &RankCache {
        &self.cache
    }

    /// Rank `candidates` with `strategy`, reading signals up to now.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for a zero trending window and
    /// [`ApiError::StoreUnavailable`] when both aggregate paths fail.
    pub async fn rank(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
    ) -> ApiResult<Vec<RankedEntity>> {
        let outcome = self.rank_outcome(candidates, strategy).await?;
        Ok(outcome.entities)
    }

    /// Rank as of now; serves a fresh cached ordering when the cache TTL allows and
    /// records every computed ordering as the last good one for its request.
    ///
    /// # Errors
    /// Same as [`Self::rank`].
    pub async fn rank_outcome(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
    ) -> ApiResult<RankOutcome> {
        reject_zero_window(strategy)?;

        let candidate_ids = candidate_set(candidates);
        let key = RankCache::key(strategy, &candidate_ids);
        if let Some(cached) = self.cache.fresh(&key, self.cache_ttl) {
            debug!(strategy = strategy.as_str(), "rank served from cache");
            return Ok(RankOutcome {
                source: RankSource::Cached,
                strategy,
                entities: cached.entities,
                caps: cached.caps,
            });
        }

        let (entities, caps) =
            self.compute(candidate_ids, strategy, OffsetDateTime::now_utc()).await?;
        self.cache.store(key, entities.clone(), caps.clone());
        Ok(RankOutcome { source: RankSource::Computed, strategy, entities, caps })
    }

    /// Point-in-time ranking with the window ending at `now`. Always computed; the
    /// cache is neither read nor written.
    ///
    /// # Errors
    /// Same as [`Self::rank`].
    pub async fn rank_at(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
        now: OffsetDateTime,
    ) -> ApiResult<RankOutcome> {
        reject_zero_window(strategy)?;
        let (entities, caps) = self.compute(candidate_set(candidates), strategy, now).await?;
        Ok(RankOutcome { source: RankSource::Computed, strategy, entities, caps })
    }

    /// Rank without ever failing the caller.
    ///
    /// On error the last good ordering for the same request is returned; without one,
    /// the caller's candidate order is kept with zero scores.
    pub async fn rank_or_fallback(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
    ) -> RankOutcome {
        match self.rank_outcome(candidates, strategy).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let key = RankCache::key(strategy, &candidate_set(candidates));
                if let Some(previous) = self.cache.last_good(&key) {
                    warn!(error = %err, strategy = strategy.as_str(), "ranking failed; serving previous ordering");
                    return RankOutcome {
                        source: RankSource::Fallback,
                        strategy,
                        entities: previous.entities,
                        caps: previous.caps,
                    };
                }
                warn!(error = %err, strategy = strategy.as_str(), "ranking failed; keeping candidate order");
                RankOutcome {
                    source: RankSource::Fallback,
                    strategy,
                    entities: candidate_order(candidates),
                    caps: Vec::new(),
                }
            }
        }
    }

    async fn compute(
        &self,
        candidate_ids: BTreeSet<EntityId>,
        strategy: RankStrategy,
        now: OffsetDateTime,
    ) -> ApiResult<(Vec<RankedEntity>, Vec<CapProfile>)> {
        let candidate_ids = candidate_ids.into_iter().collect::<Vec<_>>();
        let window = SignalWindow { start: strategy.window_start(now), end: now };
        let aggregates = self.load_aggregates(&candidate_ids, strategy, window).await?;
        let snapshot = SignalSnapshot::from_aggregates(aggregates);

        Ok(match strategy {
            RankStrategy::Trending { .. } => {
                let ranking = rank_trending(&candidate_ids, &snapshot, &self.config);
                (ranking.entities, ranking.caps)
            }
            RankStrategy::AllTimeRating => {
                (rank_all_time(&candidate_ids, &snapshot.ratings, self.config.prior), Vec::new())
            }
        })
    }

    async fn load_aggregates(
        &self,
        candidates: &[EntityId],
        strategy: RankStrategy,
        window: SignalWindow,
    ) -> ApiResult<Vec<SignalAggregate>> {
        let kinds = strategy.signal_kinds();
        let ids = candidates.to_vec();
        match self
            .store
            .with_primary(move |store| store.aggregate_signals(&ids, kinds, window))
            .await
        {
            Ok(aggregates) => Ok(aggregates),
            Err(err) => {
                warn!(error = %err, "aggregate query failed; falling back to raw scan");
                let ids = candidates.to_vec();
                self.store
                    .with_fresh(move |store| store.aggregate_signals_raw(&ids, kinds, window))
                    .await
                    .map_err(|err| ApiError::store(&err))
            }
        }
    }
}

fn reject_zero_window(strategy: RankStrategy) -> ApiResult<()> {
    if let RankStrategy::Trending { window_secs: 0 } = strategy {
        return Err(ApiError::Validation("trending window MUST be > 0".to_string()));
    }
    Ok(())
}

/// Caller order, deduplicated, with zero scores.
fn candidate_order(candidates: &[EntityId]) -> Vec<RankedEntity> {
    let mut seen = BTreeSet::new();
    candidates
        .iter()
        .filter(|id| !id.as_str().trim().is_empty() && seen.insert((*id).clone()))
        .enumerate()
        .map(|(index, id)| RankedEntity {
            rank: index + 1,
            entity_id: id.clone(),
            normalized_components: SignalComponents::default(),
            composite_score: 0.0,
        })
        .collect()
}
