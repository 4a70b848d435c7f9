//! SQLite implementation of the recommendation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::schema::SCHEMA;
use super::{RecommendationStore, Result, UserRecommendations};
use crate::data::{
    format_ts, parse_ts, ActionType, BatchLog, BatchStatus, BatchType, InteractionEvent, Item,
    ItemKey, ItemType, Recommendation, User,
};
use crate::errors::RecError;

const BATCH_LOG_COLUMNS: &str = "batch_id, batch_type, total_users, processed_users, \
     total_recommendations, start_time, end_time, status, error_message";

const INTERACTION_COLUMNS: &str =
    "ua.user_id, ua.target_id, ua.target_type, ua.action_type, ua.action_time";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Opening recommendation store at {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_user(&self, user_id: i64, region: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO users (user_id, region) VALUES (?, ?)")
            .bind(user_id)
            .bind(region)
            .execute(&self.pool)
            .await
            .map_err(RecError::persistence)?;
        Ok(())
    }

    pub async fn insert_item(&self, item: &Item) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO items (item_id, item_type, region, author_id, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item.item_id)
        .bind(item.item_type.as_str())
        .bind(&item.region)
        .bind(item.author_id)
        .bind(format_ts(&item.created_at))
        .execute(&self.pool)
        .await
        .map_err(RecError::persistence)?;
        Ok(())
    }

    pub async fn insert_action(
        &self,
        user_id: i64,
        item: ItemKey,
        action: ActionType,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_actions (user_id, target_id, target_type, action_type, action_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(item.item_id)
        .bind(item.item_type.as_str())
        .bind(action.as_str())
        .bind(format_ts(&at))
        .execute(&self.pool)
        .await
        .map_err(RecError::persistence)?;
        Ok(())
    }
}

fn interaction_from_row(row: &SqliteRow) -> Result<InteractionEvent> {
    let item_type: String = row.try_get("target_type")?;
    let action: String = row.try_get("action_type")?;
    let at: String = row.try_get("action_time")?;
    let action = ActionType::parse(&action);
    Ok(InteractionEvent {
        user_id: row.try_get("user_id")?,
        item_id: row.try_get("target_id")?,
        item_type: item_type.parse()?,
        action,
        action_weight: action.weight(),
        timestamp: parse_ts(&at)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let item_type: String = row.try_get("item_type")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Item {
        item_id: row.try_get("item_id")?,
        item_type: item_type.parse()?,
        region: row.try_get("region")?,
        author_id: row.try_get("author_id")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn recommendation_from_row(row: &SqliteRow) -> Result<Recommendation> {
    let item_type: String = row.try_get("item_type")?;
    let algorithm: String = row.try_get("algorithm_type")?;
    let created_at: String = row.try_get("created_at")?;
    let score: f64 = row.try_get("score")?;
    let rank: i64 = row.try_get("rank_position")?;
    Ok(Recommendation {
        user_id: row.try_get("user_id")?,
        item_id: row.try_get("item_id")?,
        item_type: item_type.parse()?,
        score: score as f32,
        rank_position: rank as u32,
        algorithm_type: algorithm.parse()?,
        created_at: parse_ts(&created_at)?,
    })
}

fn batch_log_from_row(row: &SqliteRow) -> Result<BatchLog> {
    let batch_type: String = row.try_get("batch_type")?;
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    Ok(BatchLog {
        batch_id: row.try_get("batch_id")?,
        batch_type: batch_type.parse()?,
        total_users: row.try_get("total_users")?,
        processed_users: row.try_get("processed_users")?,
        total_recommendations: row.try_get("total_recommendations")?,
        start_time: parse_ts(&start_time)?,
        end_time: end_time.as_deref().map(parse_ts).transpose()?,
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl RecommendationStore for SqliteStore {
    async fn users(&self, regions: &[String]) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT user_id, region FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            let user = User {
                user_id: row.try_get("user_id")?,
                region: row.try_get("region")?,
            };
            if regions.iter().any(|r| *r == user.region) {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT user_id, region FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(User {
                user_id: row.try_get("user_id")?,
                region: row.try_get("region")?,
            })),
            None => Ok(None),
        }
    }

    async fn users_active_since(&self, since: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM user_actions WHERE action_time >= ? ORDER BY user_id",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("user_id").map_err(RecError::from))
            .collect()
    }

    async fn items(&self, region: &str) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            "SELECT item_id, item_type, region, author_id, created_at FROM items \
             WHERE region = ? ORDER BY item_type, item_id",
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn interactions(
        &self,
        region: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let sql = format!(
            "SELECT {} FROM user_actions ua \
             JOIN items i ON i.item_id = ua.target_id AND i.item_type = ua.target_type \
             WHERE i.region = ? AND ua.action_time >= ? \
             ORDER BY ua.action_time, ua.action_id",
            INTERACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(region)
            .bind(format_ts(&since))
            .fetch_all(&self.pool)
            .await?;

        debug!(region, rows = rows.len(), "Loaded interactions");
        rows.iter().map(interaction_from_row).collect()
    }

    async fn user_interactions(
        &self,
        user_id: i64,
        region: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let sql = format!(
            "SELECT {} FROM user_actions ua \
             JOIN items i ON i.item_id = ua.target_id AND i.item_type = ua.target_type \
             WHERE ua.user_id = ? AND i.region = ? AND ua.action_time >= ? \
             ORDER BY ua.action_time, ua.action_id",
            INTERACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(region)
            .bind(format_ts(&since))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(interaction_from_row).collect()
    }

    async fn replace_recommendations(&self, groups: &[UserRecommendations]) -> Result<usize> {
        if groups.is_empty() {
            return Ok(0);
        }

        let now = format_ts(&Utc::now());
        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(RecError::persistence)?;

        for group in groups {
            sqlx::query("DELETE FROM recommendations WHERE user_id = ? AND item_type = ?")
                .bind(group.user_id)
                .bind(group.item_type.as_str())
                .execute(&mut *tx)
                .await
                .map_err(RecError::persistence)?;

            for rec in &group.rows {
                sqlx::query(
                    "INSERT INTO recommendations \
                     (user_id, item_id, item_type, score, rank_position, algorithm_type, \
                      created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(rec.user_id)
                .bind(rec.item_id)
                .bind(rec.item_type.as_str())
                .bind(rec.score as f64)
                .bind(rec.rank_position as i64)
                .bind(rec.algorithm_type.as_str())
                .bind(format_ts(&rec.created_at))
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(RecError::persistence)?;
                written += 1;
            }
        }

        tx.commit().await.map_err(RecError::persistence)?;
        Ok(written)
    }

    async fn recommendations(
        &self,
        user_id: i64,
        item_type: ItemType,
        limit: usize,
    ) -> Result<Vec<Recommendation>> {
        let rows = sqlx::query(
            "SELECT user_id, item_id, item_type, score, rank_position, algorithm_type, created_at \
             FROM recommendations WHERE user_id = ? AND item_type = ? \
             ORDER BY rank_position LIMIT ?",
        )
        .bind(user_id)
        .bind(item_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(recommendation_from_row).collect()
    }

    async fn purge_recommendations(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM recommendations WHERE created_at < ?")
            .bind(format_ts(&before))
            .execute(&self.pool)
            .await
            .map_err(RecError::persistence)?;
        Ok(result.rows_affected())
    }

    async fn create_batch_log(
        &self,
        batch_type: BatchType,
        regions: &[String],
        total_users: i64,
        start_time: DateTime<Utc>,
    ) -> Result<BatchLog> {
        let mut tx = self.pool.begin().await.map_err(RecError::persistence)?;
        let result = sqlx::query(
            "INSERT INTO recommendation_batch_logs \
             (batch_type, total_users, processed_users, total_recommendations, \
              start_time, status, created_at) \
             VALUES (?, ?, 0, 0, ?, 'running', ?)",
        )
        .bind(batch_type.as_str())
        .bind(total_users)
        .bind(format_ts(&start_time))
        .bind(format_ts(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(RecError::persistence)?;

        let batch_id = result.last_insert_rowid();
        for region in regions {
            sqlx::query("INSERT INTO recommendation_batch_regions (batch_id, region) VALUES (?, ?)")
                .bind(batch_id)
                .bind(region)
                .execute(&mut *tx)
                .await
                .map_err(RecError::persistence)?;
        }
        tx.commit().await.map_err(RecError::persistence)?;
        info!(batch_id, batch_type = %batch_type, ?regions, total_users, "Created batch log");

        Ok(BatchLog {
            batch_id,
            batch_type,
            total_users,
            processed_users: 0,
            total_recommendations: 0,
            start_time,
            end_time: None,
            status: BatchStatus::Running,
            error_message: None,
        })
    }

    async fn update_batch_progress(
        &self,
        batch_id: i64,
        processed_users: i64,
        total_recommendations: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE recommendation_batch_logs \
             SET processed_users = ?, total_recommendations = ? \
             WHERE batch_id = ? AND status = 'running'",
        )
        .bind(processed_users)
        .bind(total_recommendations)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(RecError::persistence)?;
        Ok(())
    }

    async fn finish_batch_log(
        &self,
        batch_id: i64,
        status: BatchStatus,
        processed_users: i64,
        total_recommendations: i64,
        error_message: Option<&str>,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        if status == BatchStatus::Running {
            return Err(RecError::InvalidValue(
                "a batch log can only be finished as completed or failed".to_string(),
            ));
        }

        let result = sqlx::query(
            "UPDATE recommendation_batch_logs \
             SET processed_users = ?, total_recommendations = ?, status = ?, \
                 error_message = ?, end_time = ? \
             WHERE batch_id = ? AND status = 'running'",
        )
        .bind(processed_users)
        .bind(total_recommendations)
        .bind(status.as_str())
        .bind(error_message)
        .bind(format_ts(&end_time))
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(RecError::persistence)?;

        if result.rows_affected() == 0 {
            return Err(RecError::Persistence(format!(
                "batch log {} is not running",
                batch_id
            )));
        }
        info!(batch_id, status = status.as_str(), "Finished batch log");
        Ok(())
    }

    async fn latest_batch_log(&self) -> Result<Option<BatchLog>> {
        let sql = format!(
            "SELECT {} FROM recommendation_batch_logs ORDER BY batch_id DESC LIMIT 1",
            BATCH_LOG_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(batch_log_from_row).transpose()
    }

    async fn recent_batch_logs(&self, limit: usize) -> Result<Vec<BatchLog>> {
        let sql = format!(
            "SELECT {} FROM recommendation_batch_logs ORDER BY batch_id DESC LIMIT ?",
            BATCH_LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_log_from_row).collect()
    }

    async fn last_completed_start(&self, region: &str) -> Result<Option<DateTime<Utc>>> {
        let start: Option<String> = sqlx::query_scalar(
            "SELECT l.start_time FROM recommendation_batch_logs l \
             JOIN recommendation_batch_regions r ON r.batch_id = l.batch_id \
             WHERE r.region = ? AND l.status = 'completed' \
             ORDER BY l.batch_id DESC LIMIT 1",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        start.as_deref().map(parse_ts).transpose()
    }

    async fn try_lock_region(
        &self,
        region: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO batch_region_locks (region, holder, acquired_at) VALUES (?, ?, ?) \
             ON CONFLICT (region) DO UPDATE \
             SET holder = excluded.holder, acquired_at = excluded.acquired_at \
             WHERE batch_region_locks.acquired_at < ?",
        )
        .bind(region)
        .bind(holder)
        .bind(format_ts(&now))
        .bind(format_ts(&stale_before))
        .execute(&self.pool)
        .await
        .map_err(RecError::persistence)?;

        let acquired = result.rows_affected() == 1;
        debug!(region, holder, acquired, "Region lock attempt");
        Ok(acquired)
    }

    async fn unlock_region(&self, region: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM batch_region_locks WHERE region = ? AND holder = ?")
            .bind(region)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(RecError::persistence)?;
        Ok(())
    }
}
