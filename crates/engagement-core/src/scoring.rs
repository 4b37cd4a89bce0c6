use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    candidate_set, count_as_f64, CapProfile, EngagementError, EntityId, RankedEntity,
    SignalAggregate, SignalComponents, SignalKind, SignalSnapshot, MAX_RATING,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendingWeights {
    pub view: f64,
    pub rating: f64,
    pub comment: f64,
}

impl Default for TrendingWeights {
    fn default() -> Self {
        Self { view: 0.20, rating: 0.45, comment: 0.35 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapPercentiles {
    pub view: f64,
    pub rating: f64,
    pub comment: f64,
}

impl Default for CapPercentiles {
    fn default() -> Self {
        Self { view: 98.0, rating: 95.0, comment: 95.0 }
    }
}

impl CapPercentiles {
    #[must_use]
    pub fn for_kind(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::View => self.view,
            SignalKind::Rating => self.rating,
            SignalKind::Comment => self.comment,
        }
    }
}

/// Prior for the all-time rating rank: `mean` is the assumed average, `weight` the
/// number of votes it is worth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BayesianPrior {
    pub mean: f64,
    pub weight: f64,
}

impl Default for BayesianPrior {
    fn default() -> Self {
        Self { mean: 3.5, weight: 8.0 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingConfig {
    pub weights: TrendingWeights,
    pub percentiles: CapPercentiles,
    pub prior: BayesianPrior,
}

impl RankingConfig {
    /// Check tunables before they reach the scorer.
    ///
    /// # Errors
    /// Returns [`EngagementError::Config`] for negative or non-finite weights, an all-zero
    /// weight vector, percentiles outside `[0, 100]`, or a non-positive prior weight.
    pub fn validate(&self) -> Result<(), EngagementError> {
        let weights = [self.weights.view, self.weights.rating, self.weights.comment];
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            return Err(EngagementError::Config(
                "trending weights MUST be finite and >= 0".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(EngagementError::Config(
                "at least one trending weight MUST be positive".to_string(),
            ));
        }

        for kind in SignalKind::ALL {
            let percentile = self.percentiles.for_kind(kind);
            if !(0.0..=100.0).contains(&percentile) {
                return Err(EngagementError::Config(format!(
                    "{} cap percentile MUST be in [0, 100]",
                    kind.as_str()
                )));
            }
        }

        if !self.prior.weight.is_finite() || self.prior.weight <= 0.0 {
            return Err(EngagementError::Config("prior weight MUST be > 0".to_string()));
        }
        if !(0.0..=MAX_RATING).contains(&self.prior.mean) {
            return Err(EngagementError::Config("prior mean MUST be in [0, 5]".to_string()));
        }

        Ok(())
    }
}

/// Clamp malformed population values (negative, NaN, infinite) to zero.
#[must_use]
pub fn sanitize_value(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Value at percentile `percentile` of `values`, using the lower nearest rank.
///
/// An empty population yields 0, which callers read as "no cap".
#[must_use]
pub fn percentile_cap(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.iter().copied().map(sanitize_value).collect::<Vec<_>>();
    sorted.sort_by(f64::total_cmp);

    let last = sorted.len() - 1;
    let fraction = if percentile.is_nan() { 0.0 } else { percentile.clamp(0.0, 100.0) / 100.0 };
    let position = (fraction * count_as_f64(u64::try_from(last).unwrap_or(u64::MAX))).floor();
    let index = if position <= 0.0 {
        0
    } else {
        // position is a non-negative whole number no larger than `last`
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = position as usize;
        index.min(last)
    };
    sorted[index]
}

#[must_use]
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (value - min) / (max - min)
    } else {
        0.0
    }
}

/// Rating average pulled toward the prior mean while the sample is small.
#[must_use]
pub fn bayesian_rating(count: u64, average: f64, prior: BayesianPrior) -> f64 {
    let votes = count_as_f64(count);
    let average = if average.is_finite() { average.clamp(0.0, MAX_RATING) } else { 0.0 };
    let total = votes + prior.weight;
    if total <= 0.0 {
        return prior.mean;
    }
    (votes / total) * average + (prior.weight / total) * prior.mean
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendingRanking {
    pub entities: Vec<RankedEntity>,
    pub caps: Vec<CapProfile>,
}

/// Cap and scale bounds for one signal population.
#[derive(Debug, Clone, Copy)]
struct SignalScale {
    cap: f64,
    upper: f64,
}

impl SignalScale {
    fn from_population(population: &[f64], percentile: f64) -> Self {
        let cap = percentile_cap(population, percentile);
        let upper = population
            .iter()
            .map(|value| apply_cap(sanitize_value(*value), cap))
            .fold(0.0_f64, f64::max);
        Self { cap, upper }
    }

    fn scale(self, raw: f64) -> f64 {
        // absent entities sit at zero, so zero anchors the lower bound
        normalize(apply_cap(sanitize_value(raw), self.cap), 0.0, self.upper)
    }
}

fn apply_cap(value: f64, cap: f64) -> f64 {
    if cap > 0.0 {
        value.min(cap)
    } else {
        value
    }
}

fn raw_signal(kind: SignalKind, aggregate: &SignalAggregate) -> f64 {
    match kind {
        SignalKind::Rating => count_as_f64(aggregate.count) * sanitize_value(aggregate.avg),
        SignalKind::View | SignalKind::Comment => count_as_f64(aggregate.count),
    }
}

/// Rank candidates by the windowed composite of views, rating power, and comments.
#[must_use]
pub fn rank_trending(
    candidates: &[EntityId],
    snapshot: &SignalSnapshot,
    config: &RankingConfig,
) -> TrendingRanking {
    let candidates = candidate_set(candidates);
    let mut caps = Vec::with_capacity(SignalKind::ALL.len());
    let mut scored: BTreeMap<EntityId, SignalComponents> =
        candidates.iter().map(|id| (id.clone(), SignalComponents::default())).collect();

    for kind in SignalKind::ALL {
        let signal = snapshot.get(kind);
        let population = signal
            .iter()
            .filter(|(id, _)| candidates.contains(*id))
            .map(|(_, aggregate)| raw_signal(kind, aggregate))
            .collect::<Vec<_>>();
        let percentile = config.percentiles.for_kind(kind);
        let scale = SignalScale::from_population(&population, percentile);
        caps.push(CapProfile { kind, percentile, cap_value: scale.cap });

        for (id, components) in &mut scored {
            let Some(aggregate) = signal.get(id) else {
                continue;
            };
            let value = scale.scale(raw_signal(kind, aggregate));
            match kind {
                SignalKind::View => components.view = value,
                SignalKind::Rating => components.rating = value,
                SignalKind::Comment => components.comment = value,
            }
        }
    }

    let weights = config.weights;
    let entities = order_ranked(scored.into_iter().map(|(id, components)| {
        let score = weights.view * components.view
            + weights.rating * components.rating
            + weights.comment * components.comment;
        (id, components, score)
    }));

    TrendingRanking { entities, caps }
}

/// Rank candidates by the all-time Bayesian-adjusted rating.
///
/// The `rating` component carries the adjusted score scaled onto `[0, 1]`.
#[must_use]
pub fn rank_all_time(
    candidates: &[EntityId],
    ratings: &BTreeMap<EntityId, SignalAggregate>,
    prior: BayesianPrior,
) -> Vec<RankedEntity> {
    order_ranked(candidate_set(candidates).into_iter().map(|id| {
        let score = match ratings.get(&id) {
            Some(aggregate) => bayesian_rating(aggregate.count, aggregate.avg, prior),
            None => bayesian_rating(0, 0.0, prior),
        };
        let components = SignalComponents { view: 0.0, rating: score / MAX_RATING, comment: 0.0 };
        (id, components, score)
    }))
}

fn order_ranked(
    scored: impl Iterator<Item = (EntityId, SignalComponents, f64)>,
) -> Vec<RankedEntity> {
    let mut scored = scored.collect::<Vec<_>>();
    scored.sort_by(|lhs, rhs| compare_scored(&lhs.0, lhs.2, &rhs.0, rhs.2));
    scored
        .into_iter()
        .enumerate()
        .map(|(index, (entity_id, normalized_components, composite_score))| RankedEntity {
            rank: index + 1,
            entity_id,
            normalized_components,
            composite_score,
        })
        .collect()
}

fn compare_scored(lhs_id: &EntityId, lhs_score: f64, rhs_id: &EntityId, rhs_score: f64) -> Ordering {
    sanitize_value(rhs_score)
        .total_cmp(&sanitize_value(lhs_score))
        .then_with(|| lhs_id.cmp(rhs_id))
}
