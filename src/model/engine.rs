use std::{collections::BTreeMap, path::Path};

use crate::{audio::AudioBuffer, config::DeviceSetting, error::EngineError, model::Device};

/// Stem name to separated samples, as produced by [`SeparationEngine::demix`].
pub type StemMap = BTreeMap<String, AudioBuffer>;

/// The neural separation capability the service drives.
///
/// Implementations construct model structures from a config descriptor, read
/// serialized weights and run the demixing forward pass. All methods may
/// block; callers keep them off the async runtime threads.
pub trait SeparationEngine: Send + Sync + 'static {
    type Model: Send + 'static;
    type Config: Send + Sync + 'static;
    type Tensor: Send + 'static;

    /// Builds an untrained model structure for `model_type` from the config
    /// descriptor at `config_path`.
    fn build_model(
        &self,
        model_type: &str,
        config_path: &Path,
    ) -> Result<(Self::Model, Self::Config), EngineError>;

    /// Deserializes the named tensors stored at `path`.
    fn read_checkpoint(
        &self,
        path: &Path,
        device: Device,
    ) -> Result<Checkpoint<Self::Tensor>, EngineError>;

    /// Copies every weight whose name matches a model parameter. Unknown and
    /// absent names are reported, not rejected.
    fn apply_weights(
        &self,
        model: &mut Self::Model,
        weights: Vec<(String, Self::Tensor)>,
    ) -> Result<WeightLoadReport, EngineError>;

    /// Moves the model to `device` and switches it to inference mode.
    fn prepare(&self, model: &mut Self::Model, device: Device) -> Result<(), EngineError>;

    fn demix(
        &self,
        config: &Self::Config,
        model: &Self::Model,
        mix: &AudioBuffer,
        device: Device,
        model_type: &str,
    ) -> Result<StemMap, EngineError>;

    fn resolve_device(&self, setting: &DeviceSetting) -> Device;

    /// Human readable accelerator description, `None` when only the CPU is usable.
    fn accelerator_name(&self) -> Option<String>;
}

/// Flattened checkpoint contents.
#[derive(Debug)]
pub struct Checkpoint<T> {
    pub entries: Vec<(String, T)>,
}

impl<T> Checkpoint<T> {
    /// Name of the container training scripts wrap the weight mapping in.
    pub const CONTAINER: &'static str = "state_dict";

    pub fn new(entries: Vec<(String, T)>) -> Self {
        Self { entries }
    }

    /// Returns the weight mapping, unwrapping the `state_dict` container when
    /// the checkpoint stores one. Sibling metadata entries are dropped.
    pub fn into_weights(self) -> Vec<(String, T)> {
        let prefix = format!("{}.", Self::CONTAINER);
        let wrapped = self.entries.iter().any(|(name, _)| name.starts_with(&prefix));
        if !wrapped {
            return self.entries;
        }
        self.entries
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(&prefix)
                    .map(|inner| (inner.to_string(), value))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightLoadReport {
    pub applied: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl WeightLoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}
