use std::{collections::HashMap, sync::Arc, time::Instant};

use parking_lot::Mutex;
use tokio::{sync::OnceCell, task};
use tracing::{info, warn};

use crate::{
    audio::AudioBuffer,
    error::{EngineError, JobError},
    model::{Device, ModelKey, ModelSpec, SeparationEngine, StemMap, WeightLoadReport},
};

/// A model with its weights applied, resident on the configured device.
pub struct LoadedModel<E: SeparationEngine> {
    key: ModelKey,
    model_type: String,
    config: E::Config,
    weights: WeightLoadReport,
    model: Mutex<E::Model>,
}

impl<E: SeparationEngine> LoadedModel<E> {
    pub fn key(&self) -> ModelKey {
        self.key
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn config(&self) -> &E::Config {
        &self.config
    }

    pub fn weights(&self) -> &WeightLoadReport {
        &self.weights
    }

    /// Runs one separation. The model lock serialises inferences on the
    /// same weights.
    pub fn demix(
        &self,
        engine: &E,
        mix: &AudioBuffer,
        device: Device,
    ) -> Result<StemMap, EngineError> {
        let model = self.model.lock();
        engine.demix(&self.config, &model, mix, device, &self.model_type)
    }
}

type Slot<E> = Arc<OnceCell<Arc<LoadedModel<E>>>>;

/// Lazily loads models by logical key and keeps them for the process
/// lifetime. Concurrent first requests for a key share one load.
pub struct ModelCache<E: SeparationEngine> {
    engine: Arc<E>,
    device: Device,
    specs: HashMap<ModelKey, ModelSpec>,
    slots: Mutex<HashMap<ModelKey, Slot<E>>>,
}

impl<E: SeparationEngine> ModelCache<E> {
    pub fn new(engine: Arc<E>, device: Device, specs: HashMap<ModelKey, ModelSpec>) -> Self {
        Self {
            engine,
            device,
            specs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn loaded_keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Returns the cached model for `key`, loading it on first use.
    ///
    /// A failed load leaves the slot empty so a later job can try again.
    pub async fn load(&self, key: ModelKey) -> Result<Arc<LoadedModel<E>>, JobError> {
        let spec = self
            .specs
            .get(&key)
            .cloned()
            .ok_or_else(|| JobError::UnknownModelKey(key.to_string()))?;

        let slot = self.slots.lock().entry(key).or_default().clone();
        let engine = self.engine.clone();
        let device = self.device;

        let loaded = slot
            .get_or_try_init(|| async move {
                task::spawn_blocking(move || load_model(engine.as_ref(), key, &spec, device))
                    .await
                    .map_err(|err| JobError::ModelLoad(format!("model load task failed: {err}")))?
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(loaded))
    }
}

fn load_model<E: SeparationEngine>(
    engine: &E,
    key: ModelKey,
    spec: &ModelSpec,
    device: Device,
) -> Result<LoadedModel<E>, JobError> {
    let start = Instant::now();
    let load_err = |err: EngineError| JobError::ModelLoad(err.to_string());

    info!(
        model = %key,
        model_type = %spec.model_type,
        checkpoint = %spec.checkpoint_path.display(),
        %device,
        "loading model"
    );

    let (mut model, config) = engine
        .build_model(&spec.model_type, &spec.config_path)
        .map_err(load_err)?;
    let checkpoint = engine
        .read_checkpoint(&spec.checkpoint_path, device)
        .map_err(load_err)?;
    let weights = engine
        .apply_weights(&mut model, checkpoint.into_weights())
        .map_err(load_err)?;
    if !weights.is_exact() {
        warn!(
            model = %key,
            missing = weights.missing.len(),
            unexpected = weights.unexpected.len(),
            "checkpoint does not match model parameters exactly"
        );
    }
    engine.prepare(&mut model, device).map_err(load_err)?;

    info!(
        model = %key,
        applied = weights.applied,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "model ready"
    );

    Ok(LoadedModel {
        key,
        model_type: spec.model_type.clone(),
        config,
        weights,
        model: Mutex::new(model),
    })
}
