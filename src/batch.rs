//! Full and incremental batch runs across regions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, TrainingConfig};
use crate::data::{BatchLog, BatchStatus, BatchType, InteractionEvent, Item, ItemType, User};
use crate::errors::RecError;
use crate::matrix::InteractionMatrix;
use crate::model::{LatentFactorModel, ModelRegistry};
use crate::popularity::PopularityIndex;
use crate::scorer::{ScoreRequest, Scorer, UserContext};
use crate::store::{RecommendationStore, UserRecommendations};

/// Region locks older than this belong to a dead run and may be taken over.
const LOCK_STALE_HOURS: i64 = 24;

/// In-process table of regions with a run in flight.
///
/// A fast path in front of the store-backed lock that other processes see.
#[derive(Clone, Default)]
pub struct RegionLocks {
    held: Arc<DashMap<String, DateTime<Utc>>>,
}

/// Releases its region when dropped.
pub struct RegionGuard {
    held: Arc<DashMap<String, DateTime<Utc>>>,
    region: String,
}

impl RegionLocks {
    pub fn try_acquire(&self, region: &str) -> Option<RegionGuard> {
        match self.held.entry(region.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(RegionGuard {
                    held: Arc::clone(&self.held),
                    region: region.to_string(),
                })
            }
        }
    }

    pub fn is_locked(&self, region: &str) -> bool {
        self.held.contains_key(region)
    }
}

impl RegionGuard {
    pub fn region(&self) -> &str {
        &self.region
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        self.held.remove(&self.region);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    processed_users: i64,
    total_recommendations: i64,
}

pub struct BatchOrchestrator {
    store: Arc<dyn RecommendationStore>,
    models: Arc<ModelRegistry>,
    config: Arc<Config>,
    locks: RegionLocks,
    holder: String,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        models: Arc<ModelRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            models,
            config,
            locks: RegionLocks::default(),
            holder: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn locks(&self) -> &RegionLocks {
        &self.locks
    }

    /// Run one batch over `region`, or over every configured region.
    ///
    /// Errors are returned only when the run is refused before its log row
    /// exists. Once started, the outcome is reported through the returned
    /// log's status.
    pub async fn run_batch(
        &self,
        mode: BatchType,
        region: Option<&str>,
    ) -> Result<BatchLog, RecError> {
        let targets = self.targets(region)?;
        let guards = self.acquire_regions(&targets).await?;
        let result = self.run_locked(mode, &targets).await;
        self.release_regions(guards).await;
        result
    }

    async fn run_locked(&self, mode: BatchType, targets: &[String]) -> Result<BatchLog, RecError> {
        let started = Utc::now();
        let users = self.users_for(mode, targets, started).await?;
        let log = self
            .store
            .create_batch_log(mode, targets, users.len() as i64, started)
            .await?;
        info!(
            batch_id = log.batch_id,
            mode = %mode,
            regions = ?targets,
            users = users.len(),
            "Starting batch"
        );

        let mut progress = Progress::default();
        let outcome = self
            .execute(mode, targets, &users, log.batch_id, started, &mut progress)
            .await;

        let end_time = Utc::now();
        let (status, error_message) = match outcome {
            Ok(()) => (BatchStatus::Completed, None),
            Err(e) => {
                error!(batch_id = log.batch_id, error = %e, "Batch failed");
                (BatchStatus::Failed, Some(e.to_string()))
            }
        };
        self.store
            .finish_batch_log(
                log.batch_id,
                status,
                progress.processed_users,
                progress.total_recommendations,
                error_message.as_deref(),
                end_time,
            )
            .await?;

        info!(
            batch_id = log.batch_id,
            status = status.as_str(),
            processed_users = progress.processed_users,
            total_recommendations = progress.total_recommendations,
            elapsed_ms = (end_time - started).num_milliseconds(),
            "Batch finished"
        );

        Ok(BatchLog {
            processed_users: progress.processed_users,
            total_recommendations: progress.total_recommendations,
            end_time: Some(end_time),
            status,
            error_message,
            ..log
        })
    }

    fn targets(&self, region: Option<&str>) -> Result<Vec<String>, RecError> {
        match region {
            Some(r) if self.config.has_region(r) => Ok(vec![r.to_string()]),
            Some(r) => Err(RecError::UnknownRegion(r.to_string())),
            None => Ok(self.config.regions.clone()),
        }
    }

    /// Lock every target region, in this process and in the store, or none.
    pub async fn acquire_regions(&self, targets: &[String]) -> Result<Vec<RegionGuard>, RecError> {
        let mut held = Vec::with_capacity(targets.len());
        for region in targets {
            match self.lock_region(region).await {
                Ok(guard) => held.push(guard),
                Err(e) => {
                    self.release_regions(held).await;
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    async fn lock_region(&self, region: &str) -> Result<RegionGuard, RecError> {
        let already_running = || RecError::BatchAlreadyRunning {
            region: region.to_string(),
        };
        let guard = self.locks.try_acquire(region).ok_or_else(already_running)?;

        let now = Utc::now();
        let stale_before = now - ChronoDuration::hours(LOCK_STALE_HOURS);
        if self
            .store
            .try_lock_region(region, &self.holder, now, stale_before)
            .await?
        {
            Ok(guard)
        } else {
            Err(already_running())
        }
    }

    pub async fn release_regions(&self, guards: Vec<RegionGuard>) {
        for guard in guards {
            if let Err(e) = self.store.unlock_region(guard.region(), &self.holder).await {
                warn!(region = guard.region(), error = %e, "Could not release region lock");
            }
        }
    }

    async fn users_for(
        &self,
        mode: BatchType,
        targets: &[String],
        started: DateTime<Utc>,
    ) -> Result<Vec<User>, RecError> {
        let users = self.store.users(targets).await?;
        match mode {
            BatchType::Full => Ok(users),
            BatchType::Incremental => {
                // each region's window opens at its own last successful run
                let mut active: HashMap<&str, HashSet<i64>> = HashMap::new();
                for region in targets {
                    let since = self
                        .store
                        .last_completed_start(region)
                        .await?
                        .unwrap_or_else(|| started - interval(&self.config));
                    let ids = self.store.users_active_since(since).await?;
                    active.insert(region.as_str(), ids.into_iter().collect());
                }
                Ok(users
                    .into_iter()
                    .filter(|u| {
                        active
                            .get(u.region.as_str())
                            .is_some_and(|ids| ids.contains(&u.user_id))
                    })
                    .collect())
            }
        }
    }

    async fn execute(
        &self,
        mode: BatchType,
        targets: &[String],
        users: &[User],
        batch_id: i64,
        started: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<(), RecError> {
        let since = started - ChronoDuration::days(self.config.training.lookback_days);
        let models = match mode {
            BatchType::Full => self.train_regions(targets, since).await,
            BatchType::Incremental => self.current_models(targets).await,
        };

        let mut processed_regions = 0;
        for region in targets {
            let (items, events) = match self.load_region(region, since).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(region = %region, error = %e, "Skipping region, source data unreadable");
                    continue;
                }
            };
            let popularity = PopularityIndex::build(region, &items, &events);
            let model = models.get(region).map(Arc::as_ref);
            if model.is_none() {
                warn!(region = %region, "No model for region, using popularity only");
            }

            let region_users: Vec<i64> = users
                .iter()
                .filter(|u| u.region == *region)
                .map(|u| u.user_id)
                .collect();
            self.score_region(batch_id, &region_users, &popularity, model, &events, progress)
                .await?;
            processed_regions += 1;
        }

        if processed_regions == 0 && !targets.is_empty() {
            return Err(RecError::NoRegionProcessed);
        }

        if mode == BatchType::Full {
            let cutoff = started - ChronoDuration::days(self.config.batch.retention_days);
            let purged = self.store.purge_recommendations(cutoff).await?;
            info!(purged, "Purged expired recommendations");
        }
        Ok(())
    }

    async fn load_region(
        &self,
        region: &str,
        since: DateTime<Utc>,
    ) -> Result<(Vec<Item>, Vec<InteractionEvent>), RecError> {
        let items = self.store.items(region).await?;
        let events = self.store.interactions(region, since).await?;
        Ok((items, events))
    }

    /// Retrain every target region in parallel; failed regions are absent.
    async fn train_regions(
        &self,
        targets: &[String],
        since: DateTime<Utc>,
    ) -> HashMap<String, Arc<LatentFactorModel>> {
        let mut tasks = JoinSet::new();
        for region in targets {
            let store = Arc::clone(&self.store);
            let models = Arc::clone(&self.models);
            let params = self.config.training.clone();
            let region = region.clone();
            tasks.spawn(async move {
                let result = train_region(store, models, &region, since, params).await;
                (region, result)
            });
        }

        let mut trained = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((region, Ok(model))) => {
                    trained.insert(region, model);
                }
                Ok((region, Err(e))) => {
                    warn!(region = %region, error = %e, "Training failed, region degrades to popularity");
                }
                Err(e) => error!(error = %e, "Training task aborted"),
            }
        }
        trained
    }

    async fn current_models(&self, targets: &[String]) -> HashMap<String, Arc<LatentFactorModel>> {
        let mut current = HashMap::new();
        for region in targets {
            match self.models.current(region).await {
                Ok(model) => {
                    current.insert(region.clone(), model);
                }
                Err(e) => warn!(region = %region, error = %e, "Model unavailable"),
            }
        }
        current
    }

    async fn score_region(
        &self,
        batch_id: i64,
        users: &[i64],
        popularity: &PopularityIndex,
        model: Option<&LatentFactorModel>,
        events: &[InteractionEvent],
        progress: &mut Progress,
    ) -> Result<(), RecError> {
        let mut contexts: HashMap<i64, UserContext> = HashMap::new();
        for event in events {
            contexts
                .entry(event.user_id)
                .or_insert_with(|| UserContext::empty(event.user_id))
                .record(event);
        }

        let scoring = &self.config.scoring;
        let scorer = Scorer::new(scoring, popularity, model);

        for group in users.chunks(self.config.batch.user_group_size) {
            let created_at = Utc::now();
            let mut rankings = Vec::with_capacity(group.len() * ItemType::ALL.len());
            for &user_id in group {
                let ctx = contexts
                    .remove(&user_id)
                    .unwrap_or_else(|| UserContext::empty(user_id));
                for item_type in ItemType::ALL {
                    let request = ScoreRequest::new(user_id, item_type, scoring.max_recommendations);
                    rankings.push(UserRecommendations {
                        user_id,
                        item_type,
                        rows: scorer.recommend(&request, &ctx, created_at)?,
                    });
                }
            }

            let written = self.store.replace_recommendations(&rankings).await?;
            progress.processed_users += group.len() as i64;
            progress.total_recommendations += written as i64;
            self.store
                .update_batch_progress(
                    batch_id,
                    progress.processed_users,
                    progress.total_recommendations,
                )
                .await?;
        }
        Ok(())
    }
}

async fn train_region(
    store: Arc<dyn RecommendationStore>,
    models: Arc<ModelRegistry>,
    region: &str,
    since: DateTime<Utc>,
    params: TrainingConfig,
) -> Result<Arc<LatentFactorModel>, RecError> {
    let events = store.interactions(region, since).await?;
    let region = region.to_string();
    tokio::task::spawn_blocking(move || -> Result<Arc<LatentFactorModel>, RecError> {
        let matrix = InteractionMatrix::build(&region, &events, params.min_interactions)?;
        let model = LatentFactorModel::train(&matrix, &params)?;
        models.publish(model)
    })
    .await
    .map_err(|e| RecError::Training(format!("training task failed: {}", e)))?
}

fn interval(config: &Config) -> ChronoDuration {
    ChronoDuration::from_std(config.batch.incremental_interval)
        .unwrap_or_else(|_| ChronoDuration::hours(6))
}
