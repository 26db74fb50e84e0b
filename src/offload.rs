use std::sync::Arc;

use tokio::{sync::Semaphore, task};
use tracing::debug;

use crate::{
    audio::AudioBuffer,
    error::JobError,
    model::{Device, LoadedModel, SeparationEngine, StemMap},
};

/// Runs demixing on the blocking thread pool, admitting at most
/// `max_concurrent` inferences at once.
pub struct InferenceOffload<E: SeparationEngine> {
    engine: Arc<E>,
    device: Device,
    permits: Arc<Semaphore>,
}

impl<E: SeparationEngine> InferenceOffload<E> {
    pub fn new(engine: Arc<E>, device: Device, max_concurrent: usize) -> Self {
        Self {
            engine,
            device,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn separate(
        &self,
        model: Arc<LoadedModel<E>>,
        mix: Arc<AudioBuffer>,
    ) -> Result<StemMap, JobError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::Inference("inference pool is closed".into()))?;
        debug!(model = %model.key(), frames = mix.num_frames(), "dispatching inference");

        let engine = self.engine.clone();
        let device = self.device;
        // The permit moves into the worker so it is held until the thread
        // actually finishes.
        task::spawn_blocking(move || {
            let _permit = permit;
            model.demix(engine.as_ref(), &mix, device)
        })
        .await
        .map_err(|err| JobError::Inference(format!("inference task failed: {err}")))?
        .map_err(|err| JobError::Inference(err.to_string()))
    }
}
