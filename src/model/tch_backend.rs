//! LibTorch-backed separation engine.
//!
//! Architectures are TorchScript modules stored as
//! `<source_dir>/<model_type>.pt`; the YAML config descriptor supplies the
//! chunking parameters and the instrument order of the model output.

use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tch::{CModule, Cuda, Kind, Tensor};
use tracing::warn;

use crate::{
    audio::AudioBuffer,
    config::DeviceSetting,
    error::EngineError,
    model::{Checkpoint, Device, SeparationEngine, StemMap, WeightLoadReport},
};

#[derive(Debug, Clone, Deserialize)]
pub struct TorchModelConfig {
    pub audio: AudioSection,
    pub training: TrainingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioSection {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    pub chunk_size: usize,
    #[serde(default = "default_num_overlap")]
    pub num_overlap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSection {
    pub instruments: Vec<String>,
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_num_overlap() -> usize {
    4
}

pub struct TorchEngine {
    source_dir: PathBuf,
}

impl TorchEngine {
    pub fn new(source_dir: PathBuf) -> Self {
        Self { source_dir }
    }
}

fn engine_err(err: impl Display) -> EngineError {
    EngineError::new(err.to_string())
}

fn to_tch(device: Device) -> tch::Device {
    match device {
        Device::Cpu => tch::Device::Cpu,
        Device::Cuda(idx) => tch::Device::Cuda(idx),
    }
}

impl SeparationEngine for TorchEngine {
    type Model = CModule;
    type Config = TorchModelConfig;
    type Tensor = Tensor;

    fn build_model(
        &self,
        model_type: &str,
        config_path: &Path,
    ) -> Result<(CModule, TorchModelConfig), EngineError> {
        let raw = fs::read_to_string(config_path)
            .map_err(|e| engine_err(format!("{}: {e}", config_path.display())))?;
        let config: TorchModelConfig = serde_yaml::from_str(&raw)
            .map_err(|e| engine_err(format!("{}: {e}", config_path.display())))?;
        if config.training.instruments.is_empty() {
            return Err(EngineError::new("config lists no instruments"));
        }
        if config.audio.chunk_size == 0 {
            return Err(EngineError::new("audio.chunk_size must be positive"));
        }

        let architecture = self.source_dir.join(format!("{model_type}.pt"));
        if !architecture.exists() {
            return Err(engine_err(format!(
                "no architecture for model type '{model_type}' at {}",
                architecture.display()
            )));
        }
        let module = CModule::load(&architecture).map_err(engine_err)?;
        Ok((module, config))
    }

    fn read_checkpoint(&self, path: &Path, device: Device) -> Result<Checkpoint<Tensor>, EngineError> {
        let entries = Tensor::load_multi_with_device(path, to_tch(device))
            .map_err(|e| engine_err(format!("{}: {e}", path.display())))?;
        Ok(Checkpoint::new(entries))
    }

    fn apply_weights(
        &self,
        model: &mut CModule,
        weights: Vec<(String, Tensor)>,
    ) -> Result<WeightLoadReport, EngineError> {
        let mut params: HashMap<String, Tensor> = model
            .named_parameters()
            .map_err(engine_err)?
            .into_iter()
            .collect();
        let mut report = WeightLoadReport::default();

        tch::no_grad(|| -> Result<(), EngineError> {
            for (name, value) in weights {
                match params.remove(&name) {
                    Some(mut target) if target.size() == value.size() => {
                        target.f_copy_(&value).map_err(engine_err)?;
                        report.applied += 1;
                    }
                    Some(target) => {
                        report.unexpected.push(name.clone());
                        params.insert(name, target);
                    }
                    None => report.unexpected.push(name),
                }
            }
            Ok(())
        })?;

        report.missing = params.into_keys().collect();
        report.missing.sort();
        Ok(report)
    }

    fn prepare(&self, model: &mut CModule, device: Device) -> Result<(), EngineError> {
        model.to(to_tch(device), Kind::Float, false);
        model.set_eval();
        Ok(())
    }

    fn demix(
        &self,
        config: &TorchModelConfig,
        model: &CModule,
        mix: &AudioBuffer,
        device: Device,
        model_type: &str,
    ) -> Result<StemMap, EngineError> {
        if mix.sample_rate != config.audio.sample_rate {
            warn!(
                model_type,
                input = mix.sample_rate,
                expected = config.audio.sample_rate,
                "input sample rate differs from model sample rate"
            );
        }
        let device = to_tch(device);
        let channels = mix.num_channels() as i64;
        let frames = mix.num_frames() as i64;
        let instruments = &config.training.instruments;
        let stems = instruments.len() as i64;
        let chunk = config.audio.chunk_size as i64;
        let step = (chunk / config.audio.num_overlap.max(1) as i64).max(1);

        tch::no_grad(|| -> Result<StemMap, EngineError> {
            let flat = mix.channels.concat();
            let input = Tensor::from_slice(&flat)
                .reshape([channels, frames])
                .to(device);
            let acc = Tensor::zeros([stems, channels, frames], (Kind::Float, device));
            let counts = Tensor::zeros([frames], (Kind::Float, device));

            // Overlapping chunks are averaged where they meet.
            let mut offset = 0;
            while offset < frames {
                let len = chunk.min(frames - offset);
                let mut segment = input.narrow(1, offset, len);
                if len < chunk {
                    segment = segment.constant_pad_nd([0, chunk - len]);
                }
                let out = model
                    .forward_ts(&[segment.unsqueeze(0)])
                    .map_err(engine_err)?
                    .squeeze_dim(0)
                    .narrow(2, 0, len);
                if out.size() != [stems, channels, len] {
                    return Err(engine_err(format!(
                        "model output shape {:?} does not match {} instruments",
                        out.size(),
                        stems
                    )));
                }
                acc.narrow(2, offset, len)
                    .f_add_(&out)
                    .map_err(engine_err)?;
                counts
                    .narrow(0, offset, len)
                    .f_add_scalar_(1.0)
                    .map_err(engine_err)?;

                if offset + len >= frames {
                    break;
                }
                offset += step;
            }

            let averaged = (acc / counts.clamp_min(1.0))
                .to_device(tch::Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous();

            let mut separated = StemMap::new();
            for (idx, name) in instruments.iter().enumerate() {
                let stem = averaged.get(idx as i64);
                let planes = (0..channels)
                    .map(|c| Vec::<f32>::try_from(&stem.get(c)).map_err(engine_err))
                    .collect::<Result<Vec<_>, _>>()?;
                separated.insert(name.clone(), AudioBuffer::new(mix.sample_rate, planes));
            }
            Ok(separated)
        })
    }

    fn resolve_device(&self, setting: &DeviceSetting) -> Device {
        match setting {
            DeviceSetting::Auto => {
                if Cuda::is_available() {
                    Device::Cuda(0)
                } else {
                    Device::Cpu
                }
            }
            DeviceSetting::Explicit(name) if name == "cpu" => Device::Cpu,
            DeviceSetting::Explicit(name) if name.starts_with("cuda") => {
                let idx = name
                    .split(':')
                    .nth(1)
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);
                Device::Cuda(idx)
            }
            DeviceSetting::Explicit(name) => {
                warn!(device = %name, "unrecognised device, using cpu");
                Device::Cpu
            }
        }
    }

    fn accelerator_name(&self) -> Option<String> {
        Cuda::is_available().then(|| format!("cuda ({} device(s))", Cuda::device_count()))
    }
}
