//! Data access for interaction sources, recommendation rows and batch logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::data::{BatchLog, BatchStatus, BatchType, InteractionEvent, Item, ItemType, Recommendation, User};
use crate::errors::RecError;

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, RecError>;

/// Fresh ranking for one (user, item type) pair; replaces whatever was stored.
#[derive(Debug, Clone)]
pub struct UserRecommendations {
    pub user_id: i64,
    pub item_type: ItemType,
    pub rows: Vec<Recommendation>,
}

/// Relational store backing the batch pipeline and the serving API.
///
/// Read failures surface as [`RecError::Database`]; every write failure is
/// reported as [`RecError::Persistence`].
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    /// Known users whose home region is one of `regions`, ascending by id.
    async fn users(&self, regions: &[String]) -> Result<Vec<User>>;

    async fn user(&self, user_id: i64) -> Result<Option<User>>;

    /// Users with at least one action at or after `since`, ascending by id.
    async fn users_active_since(&self, since: DateTime<Utc>) -> Result<Vec<i64>>;

    async fn items(&self, region: &str) -> Result<Vec<Item>>;

    /// Interactions on items of `region` recorded at or after `since`.
    async fn interactions(&self, region: &str, since: DateTime<Utc>)
        -> Result<Vec<InteractionEvent>>;

    async fn user_interactions(
        &self,
        user_id: i64,
        region: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>>;

    /// Atomically replace the rankings of every group; returns rows written.
    async fn replace_recommendations(&self, groups: &[UserRecommendations]) -> Result<usize>;

    /// Stored ranking for a user, ordered by rank position.
    async fn recommendations(
        &self,
        user_id: i64,
        item_type: ItemType,
        limit: usize,
    ) -> Result<Vec<Recommendation>>;

    /// Delete rows created before `before`; returns rows removed.
    async fn purge_recommendations(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Open a running log covering `regions`.
    async fn create_batch_log(
        &self,
        batch_type: BatchType,
        regions: &[String],
        total_users: i64,
        start_time: DateTime<Utc>,
    ) -> Result<BatchLog>;

    async fn update_batch_progress(
        &self,
        batch_id: i64,
        processed_users: i64,
        total_recommendations: i64,
    ) -> Result<()>;

    /// Move a running log to a terminal status, stamping `end_time`.
    async fn finish_batch_log(
        &self,
        batch_id: i64,
        status: BatchStatus,
        processed_users: i64,
        total_recommendations: i64,
        error_message: Option<&str>,
        end_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn latest_batch_log(&self) -> Result<Option<BatchLog>>;

    async fn recent_batch_logs(&self, limit: usize) -> Result<Vec<BatchLog>>;

    /// Start time of the newest completed run that covered `region`.
    async fn last_completed_start(&self, region: &str) -> Result<Option<DateTime<Utc>>>;

    /// Claim `region` for `holder`. A lock taken before `stale_before` is
    /// considered abandoned and is taken over. Returns false when another
    /// holder has it.
    async fn try_lock_region(
        &self,
        region: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release `region` if `holder` still owns it.
    async fn unlock_region(&self, region: &str, holder: &str) -> Result<()>;
}
