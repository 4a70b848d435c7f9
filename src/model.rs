//! Regional latent factor models: training, artifacts and the live registry.

use anyhow::Context;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data::ItemKey;
use crate::errors::RecError;
use crate::matrix::InteractionMatrix;

const CURRENT_POINTER: &str = "CURRENT";
const ARTIFACTS_KEPT: usize = 2;

/// Serialized form of a model; the index maps are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelArtifact {
    region: String,
    version: String,
    trained_at: DateTime<Utc>,
    factors: u32,
    regularization: f32,
    iterations: u32,
    user_ids: Vec<i64>,
    item_keys: Vec<ItemKey>,
    user_factors: Array2<f32>,
    item_factors: Array2<f32>,
}

/// User and item factors of one region plus the id mappings they were
/// trained with. Immutable once built.
#[derive(Debug, Clone)]
pub struct LatentFactorModel {
    artifact: ModelArtifact,
    user_index: HashMap<i64, usize>,
    item_index: HashMap<ItemKey, usize>,
}

impl LatentFactorModel {
    /// Fit implicit-feedback ALS on `matrix` for a fixed number of iterations.
    pub fn train(matrix: &InteractionMatrix, params: &TrainingConfig) -> Result<Self, RecError> {
        let started = std::time::Instant::now();

        let mut dataset = discorec::Dataset::new();
        for &(user, item, confidence) in matrix.entries() {
            dataset.push(user, item, confidence);
        }

        let mut builder = discorec::RecommenderBuilder::new();
        builder
            .factors(params.factors)
            .iterations(params.iterations)
            .regularization(params.regularization);
        let recommender = builder.fit_implicit(&dataset);

        let user_factors = collect_rows(matrix.n_users(), params.factors, |u| {
            recommender
                .user_factors(&u)
                .map(|f| f.iter().copied().collect())
        })
        .map_err(|idx| RecError::Training(format!("no factors for user index {}", idx)))?;

        let item_factors = collect_rows(matrix.n_items(), params.factors, |i| {
            recommender
                .item_factors(&i)
                .map(|f| f.iter().copied().collect())
        })
        .map_err(|idx| RecError::Training(format!("no factors for item index {}", idx)))?;

        let trained_at = Utc::now();
        let version = format!(
            "{}-{}",
            trained_at.format("%Y%m%dT%H%M%S%6f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        info!(
            region = matrix.region(),
            version = %version,
            users = matrix.n_users(),
            items = matrix.n_items(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Trained ALS model"
        );

        Self::from_artifact(ModelArtifact {
            region: matrix.region().to_string(),
            version,
            trained_at,
            factors: params.factors,
            regularization: params.regularization,
            iterations: params.iterations,
            user_ids: matrix.user_ids().to_vec(),
            item_keys: matrix.item_keys().to_vec(),
            user_factors,
            item_factors,
        })
    }

    fn from_artifact(artifact: ModelArtifact) -> Result<Self, RecError> {
        let factors = artifact.factors as usize;
        let shapes_agree = artifact.user_factors.dim() == (artifact.user_ids.len(), factors)
            && artifact.item_factors.dim() == (artifact.item_keys.len(), factors);
        if !shapes_agree {
            return Err(RecError::model_load(
                &artifact.region,
                "factor shapes do not match the id mappings",
            ));
        }

        let user_index = artifact
            .user_ids
            .iter()
            .enumerate()
            .map(|(i, u)| (*u, i))
            .collect();
        let item_index = artifact
            .item_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (*k, i))
            .collect();

        Ok(Self {
            artifact,
            user_index,
            item_index,
        })
    }

    pub fn region(&self) -> &str {
        &self.artifact.region
    }

    pub fn version(&self) -> &str {
        &self.artifact.version
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.artifact.trained_at
    }

    pub fn factors(&self) -> u32 {
        self.artifact.factors
    }

    pub fn n_users(&self) -> usize {
        self.artifact.user_ids.len()
    }

    pub fn n_items(&self) -> usize {
        self.artifact.item_keys.len()
    }

    pub fn has_user(&self, user_id: i64) -> bool {
        self.user_index.contains_key(&user_id)
    }

    pub fn user_vector(&self, user_id: i64) -> Option<ArrayView1<'_, f32>> {
        let row = *self.user_index.get(&user_id)?;
        Some(self.artifact.user_factors.row(row))
    }

    /// Raw affinity of `user_id` for `item`; `None` unless both were trained.
    pub fn affinity(&self, user_id: i64, item: &ItemKey) -> Option<f32> {
        let user = self.user_vector(user_id)?;
        let row = *self.item_index.get(item)?;
        Some(self.artifact.item_factors.row(row).dot(&user))
    }
}

fn collect_rows<F>(rows: usize, factors: u32, mut lookup: F) -> Result<Array2<f32>, usize>
where
    F: FnMut(usize) -> Option<Vec<f32>>,
{
    let cols = factors as usize;
    let mut out = Array2::<f32>::zeros((rows, cols));
    for idx in 0..rows {
        let values = lookup(idx).filter(|v| v.len() == cols).ok_or(idx)?;
        for (col, value) in values.into_iter().enumerate() {
            out[[idx, col]] = value;
        }
    }
    Ok(out)
}

/// Summary exposed through `/model/info`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub region: String,
    pub loaded: bool,
    pub version: Option<String>,
    pub trained_at: Option<DateTime<Utc>>,
    pub user_count: usize,
    pub item_count: usize,
    pub factors: Option<u32>,
    pub error: Option<String>,
}

/// Current model per region, backed by versioned artifacts on disk.
///
/// Each publish writes a new immutable `model-<version>.json`, then swaps the
/// `CURRENT` pointer by rename, then swaps the in-memory `Arc`. Readers hold
/// an `Arc` and so never observe a half-replaced model. Lookups re-read the
/// pointer, so a process serving requests follows publishes made by another.
pub struct ModelRegistry {
    dir: PathBuf,
    current: RwLock<HashMap<String, Loaded>>,
}

#[derive(Clone)]
struct Loaded {
    file_name: String,
    model: Arc<LatentFactorModel>,
}

impl ModelRegistry {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            current: RwLock::new(HashMap::new()),
        }
    }

    fn region_dir(&self, region: &str) -> PathBuf {
        self.dir.join(region)
    }

    /// Persist `model` and make it the region's current model.
    pub fn publish(&self, model: LatentFactorModel) -> Result<Arc<LatentFactorModel>, RecError> {
        let region_dir = self.region_dir(model.region());
        fs::create_dir_all(&region_dir)?;

        let file_name = format!("model-{}.json", model.version());
        let artifact_path = region_dir.join(&file_name);
        write_atomically(&artifact_path, &serde_json::to_vec(&model.artifact)?)?;
        write_atomically(&region_dir.join(CURRENT_POINTER), file_name.as_bytes())?;

        let model = Arc::new(model);
        self.current.write().insert(
            model.region().to_string(),
            Loaded {
                file_name,
                model: Arc::clone(&model),
            },
        );

        info!(region = model.region(), version = model.version(), "Published model");

        if let Err(e) = self.prune(model.region()) {
            warn!(region = model.region(), "Could not prune old model artifacts: {}", e);
        }
        Ok(model)
    }

    /// Model the region's `CURRENT` pointer names, reloading when it moved.
    ///
    /// Reads from disk; async callers go through [`ModelRegistry::current`].
    pub fn get(&self, region: &str) -> Result<Arc<LatentFactorModel>, RecError> {
        let pointer = self.read_pointer(region);
        if let Some(loaded) = self.current.read().get(region) {
            match &pointer {
                Ok(name) if *name != loaded.file_name => {}
                // unchanged, or unreadable: keep serving what we have
                _ => return Ok(Arc::clone(&loaded.model)),
            }
        }

        let file_name = pointer?;
        let model = Arc::new(self.load(region, &file_name)?);
        let mut current = self.current.write();
        let entry = current.entry(region.to_string()).or_insert_with(|| Loaded {
            file_name: file_name.clone(),
            model: Arc::clone(&model),
        });
        // names sort by version; a concurrent newer publish wins
        if entry.file_name < file_name {
            *entry = Loaded { file_name, model };
        }
        Ok(Arc::clone(&entry.model))
    }

    /// [`ModelRegistry::get`] on the blocking pool.
    pub async fn current(self: &Arc<Self>, region: &str) -> Result<Arc<LatentFactorModel>, RecError> {
        let registry = Arc::clone(self);
        let owned = region.to_string();
        tokio::task::spawn_blocking(move || registry.get(&owned))
            .await
            .map_err(|e| RecError::model_load(region, format!("load task failed: {}", e)))?
    }

    fn read_pointer(&self, region: &str) -> Result<String, RecError> {
        let region_dir = self.region_dir(region);
        fs::read_to_string(region_dir.join(CURRENT_POINTER))
            .map(|name| name.trim().to_string())
            .with_context(|| format!("no current model in {:?}", region_dir))
            .map_err(|e| RecError::model_load(region, format!("{:#}", e)))
    }

    fn load(&self, region: &str, file_name: &str) -> Result<LatentFactorModel, RecError> {
        let path = self.region_dir(region).join(file_name);
        debug!(region, path = ?path, "Loading model artifact");

        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read {:?}", path))
            .map_err(|e| RecError::model_load(region, format!("{:#}", e)))?;
        let artifact: ModelArtifact = serde_json::from_slice(&bytes)
            .map_err(|e| RecError::model_load(region, format!("corrupt artifact: {}", e)))?;
        if artifact.region != region {
            return Err(RecError::model_load(
                region,
                format!("artifact belongs to region {}", artifact.region),
            ));
        }
        LatentFactorModel::from_artifact(artifact)
    }

    pub async fn current_info(self: &Arc<Self>, region: &str) -> ModelInfo {
        match self.current(region).await {
            Ok(model) => ModelInfo {
                region: region.to_string(),
                loaded: true,
                version: Some(model.version().to_string()),
                trained_at: Some(model.trained_at()),
                user_count: model.n_users(),
                item_count: model.n_items(),
                factors: Some(model.factors()),
                error: None,
            },
            Err(e) => ModelInfo {
                region: region.to_string(),
                loaded: false,
                version: None,
                trained_at: None,
                user_count: 0,
                item_count: 0,
                factors: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn prune(&self, region: &str) -> std::io::Result<()> {
        let mut artifacts: Vec<PathBuf> = fs::read_dir(self.region_dir(region))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("model-") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        // versions start with a timestamp, so names sort oldest first
        artifacts.sort();
        let excess = artifacts.len().saturating_sub(ARTIFACTS_KEPT);
        for path in artifacts.into_iter().take(excess) {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Write to a sibling temp file, flush it to disk, then rename over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActionType, InteractionEvent, ItemType};
    use tempfile::TempDir;

    fn params() -> TrainingConfig {
        TrainingConfig {
            factors: 4,
            iterations: 5,
            ..TrainingConfig::default()
        }
    }

    fn sample_matrix(region: &str) -> InteractionMatrix {
        let now = Utc::now();
        let mut events = Vec::new();
        for user in 1..=4 {
            for item in 1..=3 {
                if (user + item) % 2 == 0 {
                    events.push(InteractionEvent::new(
                        user,
                        ItemKey::new(ItemType::Log, item),
                        ActionType::Like,
                        now,
                    ));
                }
            }
        }
        events.push(InteractionEvent::new(
            2,
            ItemKey::new(ItemType::Place, 1),
            ActionType::View,
            now,
        ));
        InteractionMatrix::build(region, &events, 1).unwrap()
    }

    #[test]
    fn test_training_covers_every_matrix_row() {
        let matrix = sample_matrix("seoul");
        let model = LatentFactorModel::train(&matrix, &params()).unwrap();
        assert_eq!(model.n_users(), matrix.n_users());
        assert_eq!(model.n_items(), matrix.n_items());
        for user in matrix.user_ids() {
            assert!(model.has_user(*user));
            for item in matrix.item_keys() {
                assert!(model.affinity(*user, item).unwrap().is_finite());
            }
        }
        assert!(model.affinity(99, &ItemKey::new(ItemType::Log, 1)).is_none());
        assert!(model.affinity(1, &ItemKey::new(ItemType::Plan, 1)).is_none());
    }

    #[tokio::test]
    async fn test_publish_then_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let model = LatentFactorModel::train(&sample_matrix("seoul"), &params()).unwrap();
        let version = model.version().to_string();
        let expected = model.affinity(1, &ItemKey::new(ItemType::Log, 1));
        registry.publish(model).unwrap();

        let fresh = Arc::new(ModelRegistry::new(dir.path()));
        let loaded = fresh.current("seoul").await.unwrap();
        assert_eq!(loaded.version(), version);
        assert_eq!(loaded.affinity(1, &ItemKey::new(ItemType::Log, 1)), expected);
        let info = fresh.current_info("seoul").await;
        assert!(info.loaded);
        assert_eq!(info.version.as_deref(), Some(version.as_str()));
    }

    #[tokio::test]
    async fn test_missing_model_is_load_error() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()));
        assert!(matches!(
            registry.get("busan"),
            Err(RecError::ModelLoad { .. })
        ));
        let info = registry.current_info("busan").await;
        assert!(!info.loaded);
        assert!(info.error.is_some());
    }

    #[test]
    fn test_corrupt_artifact_is_load_error() {
        let dir = TempDir::new().unwrap();
        let region_dir = dir.path().join("seoul");
        fs::create_dir_all(&region_dir).unwrap();
        fs::write(region_dir.join("model-broken.json"), b"{\"region\": 3").unwrap();
        fs::write(region_dir.join(CURRENT_POINTER), b"model-broken.json").unwrap();

        let registry = ModelRegistry::new(dir.path());
        assert!(matches!(
            registry.get("seoul"),
            Err(RecError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_reader_follows_publishes_from_another_registry() {
        let dir = TempDir::new().unwrap();
        let writer = ModelRegistry::new(dir.path());
        let reader = ModelRegistry::new(dir.path());
        let matrix = sample_matrix("seoul");

        let first = writer
            .publish(LatentFactorModel::train(&matrix, &params()).unwrap())
            .unwrap();
        assert_eq!(reader.get("seoul").unwrap().version(), first.version());

        let second = writer
            .publish(LatentFactorModel::train(&matrix, &params()).unwrap())
            .unwrap();
        assert_ne!(second.version(), first.version());
        assert_eq!(reader.get("seoul").unwrap().version(), second.version());
    }

    #[test]
    fn test_write_atomically_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CURRENT_POINTER);
        write_atomically(&path, b"model-a-long-previous-name.json").unwrap();
        write_atomically(&path, b"model-b.json").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "model-b.json");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_publish_swaps_and_prunes() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let matrix = sample_matrix("seoul");

        let first = registry
            .publish(LatentFactorModel::train(&matrix, &params()).unwrap())
            .unwrap();
        let held = registry.get("seoul").unwrap();
        let mut last = first.clone();
        for _ in 0..3 {
            last = registry
                .publish(LatentFactorModel::train(&matrix, &params()).unwrap())
                .unwrap();
        }

        // an earlier reader keeps its complete model
        assert_eq!(held.version(), first.version());
        assert_eq!(registry.get("seoul").unwrap().version(), last.version());

        let artifacts = fs::read_dir(dir.path().join("seoul"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("model-"))
            .count();
        assert_eq!(artifacts, ARTIFACTS_KEPT);
    }
}
