//! Per-user ranking: collaborative scores blended with popularity.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::data::{AlgorithmType, InteractionEvent, ItemKey, ItemType, Recommendation};
use crate::errors::RecError;
use crate::model::LatentFactorModel;
use crate::popularity::{PopularItem, PopularityIndex};

#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub user_id: i64,
    pub item_type: ItemType,
    pub limit: usize,
    /// Item ids of `item_type` the caller does not want back.
    pub exclude: Vec<i64>,
    pub min_score: Option<f32>,
}

impl ScoreRequest {
    pub fn new(user_id: i64, item_type: ItemType, limit: usize) -> Self {
        Self {
            user_id,
            item_type,
            limit,
            exclude: Vec::new(),
            min_score: None,
        }
    }
}

/// What the scorer knows about a user's history in the region.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub user_id: i64,
    pub interaction_count: usize,
    pub seen: HashSet<ItemKey>,
}

impl UserContext {
    pub fn from_events<'a, I>(user_id: i64, events: I) -> Self
    where
        I: IntoIterator<Item = &'a InteractionEvent>,
    {
        let mut ctx = Self::empty(user_id);
        for event in events.into_iter().filter(|e| e.user_id == user_id) {
            ctx.record(event);
        }
        ctx
    }

    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    pub fn record(&mut self, event: &InteractionEvent) {
        self.interaction_count += 1;
        self.seen.insert(event.item_key());
    }
}

/// Where a score came from. Both components are normalized to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Provenance {
    Collaborative { als: f32, popularity: f32 },
    Popularity { popularity: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub key: ItemKey,
    pub score: f32,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub algorithm: AlgorithmType,
}

impl ScoredItem {
    pub fn to_recommendation(
        &self,
        user_id: i64,
        rank_position: u32,
        created_at: DateTime<Utc>,
    ) -> Recommendation {
        Recommendation {
            user_id,
            item_id: self.key.item_id,
            item_type: self.key.item_type,
            score: self.score,
            rank_position,
            algorithm_type: self.algorithm,
            created_at,
        }
    }
}

/// Scores candidates of one region against its popularity index and, when
/// available, its latent factor model.
pub struct Scorer<'a> {
    config: &'a ScoringConfig,
    popularity: &'a PopularityIndex,
    model: Option<&'a LatentFactorModel>,
}

impl<'a> Scorer<'a> {
    pub fn new(
        config: &'a ScoringConfig,
        popularity: &'a PopularityIndex,
        model: Option<&'a LatentFactorModel>,
    ) -> Self {
        Self {
            config,
            popularity,
            model,
        }
    }

    /// Top `request.limit` items for the user, best first.
    pub fn score(
        &self,
        request: &ScoreRequest,
        user: &UserContext,
    ) -> Result<Vec<ScoredItem>, RecError> {
        let max = self.config.max_recommendations;
        if request.limit == 0 || request.limit > max {
            return Err(RecError::InvalidLimit {
                limit: request.limit,
                max,
            });
        }

        let candidates: Vec<&PopularItem> = self
            .popularity
            .ranked(request.item_type)
            .iter()
            .filter(|item| self.is_candidate(item, request, user))
            .collect();

        let mut scored = match self.collaborative_model(user) {
            Some(model) => self.blend(model, request.user_id, &candidates),
            None => candidates
                .iter()
                .map(|item| ScoredItem {
                    key: item.key,
                    score: item.score,
                    created_at: item.created_at,
                    provenance: Provenance::Popularity {
                        popularity: item.score,
                    },
                    algorithm: AlgorithmType::Popularity,
                })
                .collect(),
        };

        if let Some(min_score) = request.min_score {
            scored.retain(|item| item.score >= min_score);
        }
        scored.sort_by(rank_order);
        scored.truncate(request.limit);

        debug!(
            user_id = request.user_id,
            item_type = %request.item_type,
            candidates = candidates.len(),
            returned = scored.len(),
            "Scored user"
        );
        Ok(scored)
    }

    /// Convenience wrapper producing ranked rows ready to persist.
    pub fn recommend(
        &self,
        request: &ScoreRequest,
        user: &UserContext,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>, RecError> {
        Ok(self
            .score(request, user)?
            .iter()
            .enumerate()
            .map(|(idx, item)| item.to_recommendation(request.user_id, idx as u32 + 1, created_at))
            .collect())
    }

    /// The model, if this user qualifies for collaborative scoring.
    fn collaborative_model(&self, user: &UserContext) -> Option<&'a LatentFactorModel> {
        let model = self.model?;
        (user.interaction_count >= self.config.cold_start_threshold
            && model.has_user(user.user_id))
        .then_some(model)
    }

    fn is_candidate(&self, item: &PopularItem, request: &ScoreRequest, user: &UserContext) -> bool {
        if user.seen.contains(&item.key) || request.exclude.contains(&item.key.item_id) {
            return false;
        }
        !(self.config.exclude_own_items && item.author_id == Some(user.user_id))
    }

    fn blend(
        &self,
        model: &LatentFactorModel,
        user_id: i64,
        candidates: &[&PopularItem],
    ) -> Vec<ScoredItem> {
        let cw = self.config.collaborative_weight;
        let pw = self.config.popularity_weight;
        let algorithm = if pw == 0.0 {
            AlgorithmType::Als
        } else {
            AlgorithmType::Hybrid
        };

        let raw: Vec<Option<f32>> = candidates
            .iter()
            .map(|item| model.affinity(user_id, &item.key))
            .collect();
        let (lo, hi) = raw
            .iter()
            .flatten()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });

        candidates
            .iter()
            .zip(raw)
            .map(|(item, affinity)| match affinity {
                Some(value) => {
                    let als = if hi > lo { (value - lo) / (hi - lo) } else { 1.0 };
                    ScoredItem {
                        key: item.key,
                        score: cw * als + pw * item.score,
                        created_at: item.created_at,
                        provenance: Provenance::Collaborative {
                            als,
                            popularity: item.score,
                        },
                        algorithm,
                    }
                }
                None => ScoredItem {
                    key: item.key,
                    score: pw * item.score,
                    created_at: item.created_at,
                    provenance: Provenance::Popularity {
                        popularity: item.score,
                    },
                    algorithm: AlgorithmType::Popularity,
                },
            })
            .collect()
    }
}

fn rank_order(a: &ScoredItem, b: &ScoredItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.key.item_id.cmp(&b.key.item_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::data::{ActionType, Item};
    use crate::matrix::InteractionMatrix;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn log(id: i64) -> ItemKey {
        ItemKey::new(ItemType::Log, id)
    }

    fn items(n: i64) -> Vec<Item> {
        (1..=n)
            .map(|id| Item {
                item_id: id,
                item_type: ItemType::Log,
                region: "seoul".to_string(),
                author_id: Some(1000 + id),
                created_at: base() - Duration::hours(id),
            })
            .collect()
    }

    fn ev(user_id: i64, item_id: i64, action: ActionType) -> InteractionEvent {
        InteractionEvent::new(user_id, log(item_id), action, base())
    }

    /// Users 1..=6 touch logs 1 to 11; user 1 is the heaviest.
    fn history() -> Vec<InteractionEvent> {
        let mut events = Vec::new();
        for item in 1..=6 {
            events.push(ev(1, item, ActionType::Like));
        }
        for user in 2..=6 {
            for item in (user..user + 5).map(|i| i % 12 + 1) {
                events.push(ev(user, item, ActionType::View));
            }
        }
        events
    }

    fn trained(events: &[InteractionEvent]) -> LatentFactorModel {
        let matrix = InteractionMatrix::build("seoul", events, 1).unwrap();
        let params = TrainingConfig {
            factors: 4,
            iterations: 5,
            ..TrainingConfig::default()
        };
        LatentFactorModel::train(&matrix, &params).unwrap()
    }

    fn assert_well_formed(result: &[ScoredItem], limit: usize) {
        assert!(result.len() <= limit);
        for pair in result.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        let ids: HashSet<i64> = result.iter().map(|r| r.key.item_id).collect();
        assert_eq!(ids.len(), result.len());
    }

    #[test]
    fn test_new_user_gets_popularity() {
        let events = history();
        let popularity = PopularityIndex::build("seoul", &items(12), &events);
        let model = trained(&events);
        let config = ScoringConfig::default();
        let scorer = Scorer::new(&config, &popularity, Some(&model));

        let stranger = UserContext::from_events(42, &events);
        assert_eq!(stranger.interaction_count, 0);
        let result = scorer
            .score(&ScoreRequest::new(42, ItemType::Log, 5), &stranger)
            .unwrap();
        assert_eq!(result.len(), 5);
        assert!(result
            .iter()
            .all(|r| r.algorithm == AlgorithmType::Popularity));
        assert_well_formed(&result, 5);
    }

    #[test]
    fn test_user_below_threshold_is_cold() {
        let events = vec![
            ev(1, 1, ActionType::Like),
            ev(1, 2, ActionType::View),
            ev(2, 1, ActionType::View),
        ];
        let popularity = PopularityIndex::build("seoul", &items(4), &events);
        let model = trained(&events);
        let config = ScoringConfig::default();
        let scorer = Scorer::new(&config, &popularity, Some(&model));

        let user = UserContext::from_events(1, &events);
        assert_eq!(user.interaction_count, 2);
        let result = scorer
            .score(&ScoreRequest::new(1, ItemType::Log, 10), &user)
            .unwrap();
        assert!(result
            .iter()
            .all(|r| r.algorithm == AlgorithmType::Popularity));
        // already-seen logs 1 and 2 are gone
        let ids: Vec<i64> = result.iter().map(|r| r.key.item_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_exact_threshold_takes_collaborative_branch() {
        let events = history();
        let popularity = PopularityIndex::build("seoul", &items(11), &events);
        let model = trained(&events);
        let config = ScoringConfig {
            cold_start_threshold: 6,
            ..ScoringConfig::default()
        };
        let scorer = Scorer::new(&config, &popularity, Some(&model));

        let heavy = UserContext::from_events(1, &events);
        assert_eq!(heavy.interaction_count, 6);
        let result = scorer
            .score(&ScoreRequest::new(1, ItemType::Log, 10), &heavy)
            .unwrap();
        assert!(!result.is_empty());
        assert!(result.iter().all(|r| r.algorithm == AlgorithmType::Hybrid));
        assert!(result.iter().all(|r| !heavy.seen.contains(&r.key)));
        assert_well_formed(&result, 10);
        for item in &result {
            match item.provenance {
                Provenance::Collaborative { als, popularity } => {
                    assert!((0.0..=1.0).contains(&als));
                    let expected = 0.7 * als + 0.3 * popularity;
                    assert!((item.score - expected).abs() < 1e-6);
                }
                Provenance::Popularity { .. } => panic!("expected collaborative provenance"),
            }
        }

        let stricter = ScoringConfig {
            cold_start_threshold: 7,
            ..ScoringConfig::default()
        };
        let scorer = Scorer::new(&stricter, &popularity, Some(&model));
        let result = scorer
            .score(&ScoreRequest::new(1, ItemType::Log, 10), &heavy)
            .unwrap();
        assert!(result
            .iter()
            .all(|r| r.algorithm == AlgorithmType::Popularity));
    }

    #[test]
    fn test_zero_popularity_weight_tags_als() {
        let events = history();
        let popularity = PopularityIndex::build("seoul", &items(11), &events);
        let model = trained(&events);
        let config = ScoringConfig {
            cold_start_threshold: 1,
            collaborative_weight: 1.0,
            popularity_weight: 0.0,
            ..ScoringConfig::default()
        };
        let scorer = Scorer::new(&config, &popularity, Some(&model));
        let result = scorer
            .score(
                &ScoreRequest::new(2, ItemType::Log, 3),
                &UserContext::from_events(2, &events),
            )
            .unwrap();
        assert!(result.iter().all(|r| r.algorithm == AlgorithmType::Als));
        assert_eq!(result[0].score, 1.0);
    }

    #[test]
    fn test_items_outside_model_fall_back_to_weighted_popularity() {
        let events = history();
        // logs 12 to 14 exist but nobody touched them
        let popularity = PopularityIndex::build("seoul", &items(14), &events);
        let model = trained(&events);
        let config = ScoringConfig {
            cold_start_threshold: 1,
            ..ScoringConfig::default()
        };
        let scorer = Scorer::new(&config, &popularity, Some(&model));
        let result = scorer
            .score(
                &ScoreRequest::new(1, ItemType::Log, 50),
                &UserContext::from_events(1, &events),
            )
            .unwrap();
        let fresh: Vec<&ScoredItem> = result
            .iter()
            .filter(|r| r.key.item_id > 11)
            .collect();
        assert_eq!(fresh.len(), 3);
        assert!(fresh
            .iter()
            .all(|r| r.algorithm == AlgorithmType::Popularity && r.score == 0.0));
    }

    #[test]
    fn test_limit_above_max_is_rejected() {
        let popularity = PopularityIndex::build("seoul", &items(3), &[]);
        let config = ScoringConfig::default();
        let scorer = Scorer::new(&config, &popularity, None);
        let user = UserContext::empty(1);

        let err = scorer
            .score(&ScoreRequest::new(1, ItemType::Log, 200), &user)
            .unwrap_err();
        assert!(matches!(err, RecError::InvalidLimit { limit: 200, max: 50 }));
        assert!(scorer
            .score(&ScoreRequest::new(1, ItemType::Log, 0), &user)
            .is_err());
    }

    #[test]
    fn test_exclusions() {
        let catalogue = items(5);
        let popularity = PopularityIndex::build("seoul", &catalogue, &[]);
        let config = ScoringConfig::default();
        let scorer = Scorer::new(&config, &popularity, None);

        // user 1003 wrote log 3
        let user = UserContext::empty(1003);
        let mut request = ScoreRequest::new(1003, ItemType::Log, 10);
        request.exclude = vec![1];
        let ids: Vec<i64> = scorer
            .score(&request, &user)
            .unwrap()
            .iter()
            .map(|r| r.key.item_id)
            .collect();
        // all scores tie at 0, so newest first: log 2, 4, 5
        assert_eq!(ids, vec![2, 4, 5]);

        let keep_own = ScoringConfig {
            exclude_own_items: false,
            ..ScoringConfig::default()
        };
        let scorer = Scorer::new(&keep_own, &popularity, None);
        assert_eq!(scorer.score(&request, &user).unwrap().len(), 4);
    }

    #[test]
    fn test_recommend_assigns_consecutive_ranks() {
        let events = history();
        let popularity = PopularityIndex::build("seoul", &items(12), &events);
        let config = ScoringConfig::default();
        let scorer = Scorer::new(&config, &popularity, None);
        let mut request = ScoreRequest::new(9, ItemType::Log, 4);
        request.min_score = Some(0.01);
        let rows = scorer
            .recommend(&request, &UserContext::from_events(9, &events), base())
            .unwrap();
        assert_eq!(rows.len(), 4);
        let ranks: Vec<u32> = rows.iter().map(|r| r.rank_position).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        assert!(rows.iter().all(|r| r.score >= 0.01 && r.user_id == 9));
    }
}
