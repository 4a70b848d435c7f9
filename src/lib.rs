//! Regional collaborative-filtering recommendations.
//!
//! A batch pipeline trains one ALS model per region, scores every user
//! against it (blended with item popularity) and stores ranked rows that a
//! small HTTP API serves, falling back to popularity for cold users.

pub mod api;
pub mod batch;
pub mod config;
pub mod data;
pub mod errors;
pub mod matrix;
pub mod model;
pub mod popularity;
pub mod scheduler;
pub mod scorer;
pub mod store;

pub use batch::BatchOrchestrator;
pub use config::Config;
pub use errors::{AppError, RecError};
pub use model::{LatentFactorModel, ModelRegistry};
pub use store::{RecommendationStore, SqliteStore};
