pub mod audio;
pub mod config;
pub mod error;
pub mod jobs;
pub mod model;
pub mod offload;
pub mod orchestrator;
pub mod reconcile;
pub mod server;
pub mod staging;

pub use config::{AppConfig, DeviceSetting};
pub use jobs::{JobId, JobRegistry, JobStatus, TaskRecord};
pub use model::{ModelCache, ModelKey, SeparationEngine};
pub use orchestrator::{SeparationJob, Separator, TimeWindow};
pub use server::build_router;
