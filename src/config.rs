use std::{
    collections::HashMap,
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::model::{ModelKey, ModelSpec};

/// Compute device requested by configuration. `Auto` is resolved by the
/// inference engine at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSetting {
    Auto,
    Explicit(String),
}

impl DeviceSetting {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            DeviceSetting::Auto
        } else {
            DeviceSetting::Explicit(trimmed.to_lowercase())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub engine_source_path: PathBuf,
    pub models: HashMap<ModelKey, ModelSpec>,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub device: DeviceSetting,
    pub max_concurrent_inferences: usize,
    pub max_upload_bytes: usize,
    pub fetch_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:6006".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6006));

        let engine_source_path =
            PathBuf::from(env::var("ENGINE_SOURCE_PATH").unwrap_or_else(|_| "engine".to_string()));

        let mut models = HashMap::new();
        models.insert(
            ModelKey::Official,
            ModelSpec {
                model_type: env::var("OFFICIAL_MODEL_TYPE")
                    .unwrap_or_else(|_| "htdemucs".to_string()),
                config_path: PathBuf::from(
                    env::var("OFFICIAL_MODEL_CONFIG")
                        .unwrap_or_else(|_| "models/official.yaml".to_string()),
                ),
                checkpoint_path: PathBuf::from(
                    env::var("OFFICIAL_MODEL_CHECKPOINT")
                        .unwrap_or_else(|_| "models/official.ckpt".to_string()),
                ),
            },
        );
        // The fine-tuned model only exists once both artifacts are configured.
        if let (Ok(config_path), Ok(checkpoint_path)) = (
            env::var("FINETUNED_MODEL_CONFIG"),
            env::var("FINETUNED_MODEL_CHECKPOINT"),
        ) {
            models.insert(
                ModelKey::Finetuned,
                ModelSpec {
                    model_type: env::var("FINETUNED_MODEL_TYPE")
                        .unwrap_or_else(|_| "htdemucs".to_string()),
                    config_path: PathBuf::from(config_path),
                    checkpoint_path: PathBuf::from(checkpoint_path),
                },
            );
        }

        let upload_dir =
            PathBuf::from(env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()));
        let output_dir =
            PathBuf::from(env::var("OUTPUT_DIR").unwrap_or_else(|_| "outputs".to_string()));

        let device = DeviceSetting::parse(&env::var("DEVICE").unwrap_or_else(|_| "auto".into()));

        let max_concurrent_inferences = env::var("MAX_CONCURRENT_INFERENCES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(1);
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(256 * 1024 * 1024);
        let fetch_timeout = env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(120));

        Ok(Self {
            listen_addr,
            engine_source_path,
            models,
            upload_dir,
            output_dir,
            device,
            max_concurrent_inferences,
            max_upload_bytes,
            fetch_timeout,
        })
    }

    /// Creates the staging and output directories if they are missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}
