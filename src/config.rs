use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Knobs that shape a single user's ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub collaborative_weight: f32,
    pub popularity_weight: f32,
    pub cold_start_threshold: usize,
    pub exclude_own_items: bool,
    pub max_recommendations: usize,
    pub default_limit: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            collaborative_weight: 0.7,
            popularity_weight: 0.3,
            cold_start_threshold: 5,
            exclude_own_items: true,
            max_recommendations: 50,
            default_limit: 10,
        }
    }
}

/// ALS hyperparameters, fixed per deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub factors: u32,
    pub regularization: f32,
    pub iterations: u32,
    pub min_interactions: usize,
    pub lookback_days: i64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            factors: 32,
            regularization: 0.01,
            iterations: 15,
            min_interactions: 1,
            lookback_days: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub full_batch_hour: u32,
    pub incremental_interval: Duration,
    pub retention_days: i64,
    pub user_group_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            full_batch_hour: 2,
            incremental_interval: Duration::from_secs(6 * 3600),
            retention_days: 30,
            user_group_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub model_dir: PathBuf,
    pub regions: Vec<String>,
    pub cache_ttl: Duration,
    pub scoring: ScoringConfig,
    pub training: TrainingConfig,
    pub batch: BatchConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scoring_defaults = ScoringConfig::default();
        let training_defaults = TrainingConfig::default();
        let batch_defaults = BatchConfig::default();

        let regions = lookup("REC_REGIONS")
            .unwrap_or_else(|| "default".to_string())
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();

        let config = Config {
            service_name: lookup("SERVICE_NAME")
                .unwrap_or_else(|| "recommendation-service".to_string()),
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "PORT", 8000)?,
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://recommendations.db".to_string()),
            model_dir: lookup("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models")),
            regions,
            cache_ttl: Duration::from_secs(parse_or(&lookup, "CACHE_TTL_SECONDS", 300)?),
            scoring: ScoringConfig {
                collaborative_weight: parse_or(
                    &lookup,
                    "REC_COLLABORATIVE_WEIGHT",
                    scoring_defaults.collaborative_weight,
                )?,
                popularity_weight: parse_or(
                    &lookup,
                    "REC_POPULARITY_WEIGHT",
                    scoring_defaults.popularity_weight,
                )?,
                cold_start_threshold: parse_or(
                    &lookup,
                    "REC_COLD_START_THRESHOLD",
                    scoring_defaults.cold_start_threshold,
                )?,
                exclude_own_items: parse_or(
                    &lookup,
                    "REC_EXCLUDE_OWN_ITEMS",
                    scoring_defaults.exclude_own_items,
                )?,
                max_recommendations: parse_or(
                    &lookup,
                    "REC_MAX_RECOMMENDATIONS",
                    scoring_defaults.max_recommendations,
                )?,
                default_limit: parse_or(
                    &lookup,
                    "REC_DEFAULT_LIMIT",
                    scoring_defaults.default_limit,
                )?,
            },
            training: TrainingConfig {
                factors: parse_or(&lookup, "ALS_FACTORS", training_defaults.factors)?,
                regularization: parse_or(
                    &lookup,
                    "ALS_REGULARIZATION",
                    training_defaults.regularization,
                )?,
                iterations: parse_or(&lookup, "ALS_ITERATIONS", training_defaults.iterations)?,
                min_interactions: parse_or(
                    &lookup,
                    "REC_MIN_INTERACTIONS",
                    training_defaults.min_interactions,
                )?,
                lookback_days: parse_or(
                    &lookup,
                    "REC_LOOKBACK_DAYS",
                    training_defaults.lookback_days,
                )?,
            },
            batch: BatchConfig {
                full_batch_hour: parse_or(
                    &lookup,
                    "BATCH_FULL_HOUR",
                    batch_defaults.full_batch_hour,
                )?,
                incremental_interval: Duration::from_secs(
                    parse_or::<u64, _>(&lookup, "BATCH_INCREMENTAL_HOURS", 6)? * 3600,
                ),
                retention_days: parse_or(
                    &lookup,
                    "REC_RETENTION_DAYS",
                    batch_defaults.retention_days,
                )?,
                user_group_size: parse_or(
                    &lookup,
                    "BATCH_USER_GROUP_SIZE",
                    batch_defaults.user_group_size,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            bail!("REC_REGIONS must name at least one region");
        }
        for region in &self.regions {
            if !region
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                bail!("Invalid region name {:?}", region);
            }
        }
        let weights = [
            self.scoring.collaborative_weight,
            self.scoring.popularity_weight,
        ];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            bail!("Blend weights must lie in [0, 1]");
        }
        if self.scoring.max_recommendations == 0 {
            bail!("REC_MAX_RECOMMENDATIONS must be positive");
        }
        if self.scoring.default_limit == 0
            || self.scoring.default_limit > self.scoring.max_recommendations
        {
            bail!(
                "REC_DEFAULT_LIMIT must be between 1 and {}",
                self.scoring.max_recommendations
            );
        }
        if self.batch.full_batch_hour > 23 {
            bail!("BATCH_FULL_HOUR must be an hour of the day");
        }
        if self.batch.incremental_interval.is_zero() {
            bail!("BATCH_INCREMENTAL_HOURS must be positive");
        }
        if self.batch.user_group_size == 0 {
            bail!("BATCH_USER_GROUP_SIZE must be positive");
        }
        if self.training.factors == 0 || self.training.iterations == 0 {
            bail!("ALS_FACTORS and ALS_ITERATIONS must be positive");
        }
        Ok(())
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        None => Ok(default),
    }
}
