//! SQL schema for the recommendation store.

pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    region TEXT NOT NULL
)
"#;

pub const CREATE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    item_id INTEGER NOT NULL,
    item_type TEXT NOT NULL CHECK (item_type IN ('log', 'place', 'plan')),
    region TEXT NOT NULL,
    author_id INTEGER,
    created_at TEXT NOT NULL,
    PRIMARY KEY (item_type, item_id)
)
"#;

pub const CREATE_ITEMS_REGION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_items_region ON items (region)";

pub const CREATE_USER_ACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_actions (
    action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    action_time TEXT NOT NULL
)
"#;

pub const CREATE_USER_ACTIONS_TIME_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_user_actions_time ON user_actions (action_time)";

pub const CREATE_USER_ACTIONS_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_user_actions_user ON user_actions (user_id, action_time)";

pub const CREATE_RECOMMENDATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recommendations (
    recommendation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    item_type TEXT NOT NULL CHECK (item_type IN ('log', 'place', 'plan')),
    score REAL NOT NULL,
    rank_position INTEGER NOT NULL,
    algorithm_type TEXT NOT NULL CHECK (algorithm_type IN ('als', 'popularity', 'hybrid')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, item_type, item_id)
)
"#;

pub const CREATE_RECOMMENDATIONS_USER_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_recommendations_user \
     ON recommendations (user_id, item_type, rank_position)";

// end_time is present exactly when the run has left the running state.
pub const CREATE_BATCH_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recommendation_batch_logs (
    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_type TEXT NOT NULL CHECK (batch_type IN ('full', 'incremental')),
    total_users INTEGER NOT NULL DEFAULT 0,
    processed_users INTEGER NOT NULL DEFAULT 0,
    total_recommendations INTEGER NOT NULL DEFAULT 0,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    error_message TEXT,
    created_at TEXT NOT NULL,
    CHECK ((status = 'running') = (end_time IS NULL))
)
"#;

/// Regions covered by each batch run.
pub const CREATE_BATCH_REGIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS recommendation_batch_regions (
    batch_id INTEGER NOT NULL REFERENCES recommendation_batch_logs (batch_id),
    region TEXT NOT NULL,
    PRIMARY KEY (batch_id, region)
)
"#;

pub const CREATE_BATCH_REGIONS_REGION_INDEX: &str = "CREATE INDEX IF NOT EXISTS \
     idx_batch_regions_region ON recommendation_batch_regions (region, batch_id)";

// One row per region with a run in flight, shared by every process on the database.
pub const CREATE_REGION_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batch_region_locks (
    region TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL
)
"#;

pub const SCHEMA: &[&str] = &[
    CREATE_USERS_TABLE,
    CREATE_ITEMS_TABLE,
    CREATE_ITEMS_REGION_INDEX,
    CREATE_USER_ACTIONS_TABLE,
    CREATE_USER_ACTIONS_TIME_INDEX,
    CREATE_USER_ACTIONS_USER_INDEX,
    CREATE_RECOMMENDATIONS_TABLE,
    CREATE_RECOMMENDATIONS_USER_INDEX,
    CREATE_BATCH_LOGS_TABLE,
    CREATE_BATCH_REGIONS_TABLE,
    CREATE_BATCH_REGIONS_REGION_INDEX,
    CREATE_REGION_LOCKS_TABLE,
];
