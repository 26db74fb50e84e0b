mod cache;
mod engine;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use cache::{LoadedModel, ModelCache};
pub use engine::{Checkpoint, SeparationEngine, StemMap, WeightLoadReport};
pub use types::{Device, ModelKey, ModelSpec};
