use std::{path::PathBuf, sync::Arc, time::Instant};

use tokio::task;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    audio::{self, AudioBuffer},
    config::AppConfig,
    error::JobError,
    jobs::{JobId, JobRegistry, TaskRecord, Transition},
    model::{Device, ModelCache, ModelKey, SeparationEngine},
    offload::InferenceOffload,
    reconcile::{self, ACCOMPANIMENT, SeparatedStems, VOCALS},
    staging::StagedInput,
};

pub const OUTPUT_EXTENSION: &str = "wav";

/// Optional `[start, end)` window in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Everything needed to run one separation in the background.
#[derive(Debug)]
pub struct SeparationJob {
    pub task_id: JobId,
    pub model: ModelKey,
    pub input: StagedInput,
    pub window: TimeWindow,
}

struct StemLocations {
    vocals_url: String,
    accompaniment_url: String,
}

/// Drives jobs from submission to a terminal state. The only writer of the
/// job registry.
pub struct Separator<E: SeparationEngine> {
    engine: Arc<E>,
    registry: Arc<JobRegistry>,
    models: Arc<ModelCache<E>>,
    offload: InferenceOffload<E>,
    output_dir: PathBuf,
}

impl<E: SeparationEngine> Separator<E> {
    pub fn new(config: &AppConfig, engine: Arc<E>, registry: Arc<JobRegistry>) -> Self {
        let device = engine.resolve_device(&config.device);
        let models = Arc::new(ModelCache::new(
            engine.clone(),
            device,
            config.models.clone(),
        ));
        let offload =
            InferenceOffload::new(engine.clone(), device, config.max_concurrent_inferences);
        Self {
            engine,
            registry,
            models,
            offload,
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn models(&self) -> &Arc<ModelCache<E>> {
        &self.models
    }

    pub fn device(&self) -> Device {
        self.models.device()
    }

    pub fn accelerator_name(&self) -> Option<String> {
        self.engine.accelerator_name()
    }

    /// Records the job as pending and runs it on a background task.
    pub fn submit(self: &Arc<Self>, job: SeparationJob) -> TaskRecord {
        let record = self.registry.create(job.task_id, job.model);
        let span = info_span!("separation", task_id = %job.task_id, model = %job.model);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(job).await }.instrument(span));
        record
    }

    async fn run(&self, job: SeparationJob) {
        let SeparationJob {
            task_id,
            model,
            input,
            window,
        } = job;
        let start = Instant::now();
        self.registry.transition(task_id, Transition::Processing);

        let outcome = self.execute(task_id, model, &input, window).await;
        // The input goes away before the terminal state becomes visible.
        input.remove().await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let transition = match outcome {
            Ok(locations) => {
                info!(elapsed_ms, "separation completed");
                Transition::Completed {
                    vocals_url: locations.vocals_url,
                    accompaniment_url: locations.accompaniment_url,
                }
            }
            Err(err) => {
                warn!(elapsed_ms, error = %err, "separation failed");
                Transition::Failed {
                    error: err.to_string(),
                }
            }
        };
        self.registry.transition(task_id, transition);
    }

    async fn execute(
        &self,
        task_id: JobId,
        model: ModelKey,
        input: &StagedInput,
        window: TimeWindow,
    ) -> Result<StemLocations, JobError> {
        let path = input.path().to_path_buf();
        let mix = task::spawn_blocking(move || audio::decode_file(&path))
            .await
            .map_err(|err| JobError::Decode(format!("decode task failed: {err}")))??;
        let mix = mix.into_stereo()?.slice_seconds(window.start, window.end)?;
        let mix = Arc::new(mix);

        let loaded = self.models.load(model).await?;
        let stems = self.offload.separate(loaded, mix.clone()).await?;
        let separated = reconcile::reconcile(stems, &mix)?;

        self.persist(task_id, separated).await
    }

    async fn persist(
        &self,
        task_id: JobId,
        stems: SeparatedStems,
    ) -> Result<StemLocations, JobError> {
        let dir = self.output_dir.join(task_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.clone();
        let written = task::spawn_blocking(move || {
            write_stem(&target, VOCALS, &stems.vocals)?;
            write_stem(&target, ACCOMPANIMENT, &stems.accompaniment)
        })
        .await
        .map_err(|err| JobError::Encode(format!("encode task failed: {err}")))
        .and_then(|written| written);

        if let Err(err) = written {
            // No half-written result stays downloadable.
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(err);
        }

        Ok(StemLocations {
            vocals_url: output_url(task_id, VOCALS),
            accompaniment_url: output_url(task_id, ACCOMPANIMENT),
        })
    }
}

fn write_stem(dir: &std::path::Path, stem: &str, buffer: &AudioBuffer) -> Result<(), JobError> {
    audio::write_wav(&dir.join(format!("{stem}.{OUTPUT_EXTENSION}")), buffer)
}

/// Public URL of a persisted stem, served by the files route.
pub fn output_url(task_id: JobId, stem: &str) -> String {
    format!("/files/{task_id}/{stem}.{OUTPUT_EXTENSION}")
}
