use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod scoring;

pub use scoring::{
    bayesian_rating, normalize, percentile_cap, rank_all_time, rank_trending, sanitize_value,
    BayesianPrior, CapPercentiles, RankingConfig, TrendingRanking, TrendingWeights,
};

/// Upper bound of the rating scale.
pub const MAX_RATING: f64 = 5.0;

/// Default trailing window for trending ranks (14 days).
pub const DEFAULT_TRENDING_WINDOW_SECS: u64 = 14 * 24 * 60 * 60;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngagementError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    View,
    Rating,
    Comment,
}

impl SignalKind {
    pub const ALL: [Self; 3] = [Self::View, Self::Rating, Self::Comment];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Rating => "rating",
            Self::Comment => "comment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "view" => Some(Self::View),
            "rating" => Some(Self::Rating),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }

    /// Count-only kinds carry a fixed value of 1.
    #[must_use]
    pub fn is_count_only(self) -> bool {
        !matches!(self, Self::Rating)
    }
}

/// One append-only interaction record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngagementEvent {
    pub event_id: EventId,
    pub entity_id: EntityId,
    pub actor_id: ActorId,
    pub kind: SignalKind,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl EngagementEvent {
    #[must_use]
    pub fn view(entity_id: EntityId, actor_id: ActorId, occurred_at: OffsetDateTime) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id,
            actor_id,
            kind: SignalKind::View,
            value: 1.0,
            occurred_at,
        }
    }

    #[must_use]
    pub fn comment(entity_id: EntityId, actor_id: ActorId, occurred_at: OffsetDateTime) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id,
            actor_id,
            kind: SignalKind::Comment,
            value: 1.0,
            occurred_at,
        }
    }

    #[must_use]
    pub fn rating(
        entity_id: EntityId,
        actor_id: ActorId,
        score: f64,
        occurred_at: OffsetDateTime,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id,
            actor_id,
            kind: SignalKind::Rating,
            value: score,
            occurred_at,
        }
    }

    /// Validate one event before it is appended to the signal store.
    ///
    /// # Errors
    /// Returns [`EngagementError::Validation`] when ids are blank, a count-only kind
    /// carries a value other than 1, or a rating falls outside `[0, 5]`.
    pub fn validate(&self) -> Result<(), EngagementError> {
        if self.entity_id.0.trim().is_empty() {
            return Err(EngagementError::Validation("entity_id MUST be non-empty".to_string()));
        }

        if self.actor_id.0.trim().is_empty() {
            return Err(EngagementError::Validation("actor_id MUST be non-empty".to_string()));
        }

        if !self.value.is_finite() {
            return Err(EngagementError::Validation("value MUST be finite".to_string()));
        }

        if self.kind.is_count_only() {
            if (self.value - 1.0).abs() > f64::EPSILON {
                return Err(EngagementError::Validation(format!(
                    "{} events MUST carry value 1",
                    self.kind.as_str()
                )));
            }
        } else if !(0.0..=MAX_RATING).contains(&self.value) {
            return Err(EngagementError::Validation(
                "rating value MUST be in [0.0, 5.0]".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-entity totals for one signal kind over a window.
///
/// Only exists for `count > 0`; an entity with no events for a kind has no aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalAggregate {
    pub entity_id: EntityId,
    pub kind: SignalKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub window_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
}

impl SignalAggregate {
    #[must_use]
    pub fn new(
        entity_id: EntityId,
        kind: SignalKind,
        window_start: Option<OffsetDateTime>,
        window_end: OffsetDateTime,
        count: u64,
        sum: f64,
    ) -> Option<Self> {
        if count == 0 {
            return None;
        }
        let sum = sanitize_value(sum);
        Some(Self {
            entity_id,
            kind,
            window_start,
            window_end,
            count,
            sum,
            avg: sum / count_as_f64(count),
        })
    }
}

/// Aggregates for one ranking request, split per signal kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSnapshot {
    pub views: BTreeMap<EntityId, SignalAggregate>,
    pub ratings: BTreeMap<EntityId, SignalAggregate>,
    pub comments: BTreeMap<EntityId, SignalAggregate>,
}

impl SignalSnapshot {
    #[must_use]
    pub fn from_aggregates(aggregates: impl IntoIterator<Item = SignalAggregate>) -> Self {
        let mut snapshot = Self::default();
        for aggregate in aggregates {
            snapshot.insert(aggregate);
        }
        snapshot
    }

    pub fn insert(&mut self, aggregate: SignalAggregate) {
        let map = match aggregate.kind {
            SignalKind::View => &mut self.views,
            SignalKind::Rating => &mut self.ratings,
            SignalKind::Comment => &mut self.comments,
        };
        map.insert(aggregate.entity_id.clone(), aggregate);
    }

    #[must_use]
    pub fn get(&self, kind: SignalKind) -> &BTreeMap<EntityId, SignalAggregate> {
        match kind {
            SignalKind::View => &self.views,
            SignalKind::Rating => &self.ratings,
            SignalKind::Comment => &self.comments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapProfile {
    pub kind: SignalKind,
    pub percentile: f64,
    pub cap_value: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalComponents {
    pub view: f64,
    pub rating: f64,
    pub comment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedEntity {
    pub rank: usize,
    pub entity_id: EntityId,
    pub normalized_components: SignalComponents,
    pub composite_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RankStrategy {
    Trending { window_secs: u64 },
    AllTimeRating,
}

impl RankStrategy {
    #[must_use]
    pub fn trending_default() -> Self {
        Self::Trending { window_secs: DEFAULT_TRENDING_WINDOW_SECS }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trending { .. } => "trending",
            Self::AllTimeRating => "all_time_rating",
        }
    }

    /// Lower bound of the aggregation window relative to `now`, or `None` for all-time.
    #[must_use]
    pub fn window_start(self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Trending { window_secs } => {
                let secs = i64::try_from(window_secs).unwrap_or(i64::MAX);
                now.checked_sub(time::Duration::seconds(secs))
                    .or(Some(OffsetDateTime::UNIX_EPOCH))
            }
            Self::AllTimeRating => None,
        }
    }

    /// Signal kinds the strategy reads from the store.
    #[must_use]
    pub fn signal_kinds(self) -> &'static [SignalKind] {
        match self {
            Self::Trending { .. } => &SignalKind::ALL,
            Self::AllTimeRating => &[SignalKind::Rating],
        }
    }
}

/// Deduplicate a candidate list into a stable id-ordered set.
#[must_use]
pub fn candidate_set(candidates: &[EntityId]) -> BTreeSet<EntityId> {
    candidates.iter().filter(|id| !id.0.trim().is_empty()).cloned().collect()
}

pub(crate) fn count_as_f64(count: u64) -> f64 {
    f64::from(u32::try_from(count).unwrap_or(u32::MAX))
}
