use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::RecError;

/// Kind of recommendable item. The three kinds have independent id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Log,
    Place,
    Plan,
}

impl ItemType {
    pub const ALL: [ItemType; 3] = [ItemType::Log, ItemType::Place, ItemType::Plan];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Log => "log",
            ItemType::Place => "place",
            ItemType::Plan => "plan",
        }
    }
}

impl FromStr for ItemType {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(ItemType::Log),
            "place" => Ok(ItemType::Place),
            "plan" => Ok(ItemType::Plan),
            other => Err(RecError::InvalidValue(format!("unknown item type: {}", other))),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User action recorded against an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Post,
    Like,
    Comment,
    View,
    Other,
}

impl ActionType {
    /// Confidence contributed by one occurrence of this action.
    pub fn weight(&self) -> f32 {
        match self {
            ActionType::Post => 5.0,
            ActionType::Like => 4.0,
            ActionType::Comment => 3.0,
            ActionType::View | ActionType::Other => 1.0,
        }
    }

    /// Lenient parse used for rows read from the store.
    pub fn parse(s: &str) -> Self {
        match s {
            "post" => ActionType::Post,
            "like" => ActionType::Like,
            "comment" => ActionType::Comment,
            "view" => ActionType::View,
            _ => ActionType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Post => "post",
            ActionType::Like => "like",
            ActionType::Comment => "comment",
            ActionType::View => "view",
            ActionType::Other => "other",
        }
    }
}

/// Provenance of a recommendation score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmType {
    Als,
    Popularity,
    Hybrid,
}

impl AlgorithmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmType::Als => "als",
            AlgorithmType::Popularity => "popularity",
            AlgorithmType::Hybrid => "hybrid",
        }
    }
}

impl FromStr for AlgorithmType {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "als" => Ok(AlgorithmType::Als),
            "popularity" => Ok(AlgorithmType::Popularity),
            "hybrid" => Ok(AlgorithmType::Hybrid),
            other => Err(RecError::InvalidValue(format!("unknown algorithm type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    Full,
    Incremental,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Full => "full",
            BatchType::Incremental => "incremental",
        }
    }
}

impl FromStr for BatchType {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BatchType::Full),
            "incremental" => Ok(BatchType::Incremental),
            other => Err(RecError::InvalidValue(format!("unknown batch type: {}", other))),
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(RecError::InvalidValue(format!("unknown batch status: {}", other))),
        }
    }
}

/// Identity of an item across the three id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub item_type: ItemType,
    pub item_id: i64,
}

impl ItemKey {
    pub fn new(item_type: ItemType, item_id: i64) -> Self {
        Self { item_type, item_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: i64,
    pub item_type: ItemType,
    pub region: String,
    pub author_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.item_type, self.item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub region: String,
}

/// One recorded engagement of a user with an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: i64,
    pub item_id: i64,
    pub item_type: ItemType,
    pub action: ActionType,
    pub action_weight: f32,
    pub timestamp: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(
        user_id: i64,
        item: ItemKey,
        action: ActionType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            item_id: item.item_id,
            item_type: item.item_type,
            action,
            action_weight: action.weight(),
            timestamp,
        }
    }

    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.item_type, self.item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub user_id: i64,
    pub item_id: i64,
    pub item_type: ItemType,
    pub score: f32,
    pub rank_position: u32,
    pub algorithm_type: AlgorithmType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLog {
    pub batch_id: i64,
    pub batch_type: BatchType,
    pub total_users: i64,
    pub processed_users: i64,
    pub total_recommendations: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub error_message: Option<String>,
}

impl BatchLog {
    pub fn is_running(&self) -> bool {
        self.status == BatchStatus::Running
    }
}

/// Fixed-width RFC 3339 so that stored timestamps compare lexicographically.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, RecError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecError::InvalidValue(format!("bad timestamp {:?}: {}", raw, e)))
}
