use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Logical name selecting a configured checkpoint/config pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKey {
    Official,
    Finetuned,
}

impl ModelKey {
    pub const ALL: [ModelKey; 2] = [ModelKey::Official, ModelKey::Finetuned];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKey::Official => "official",
            ModelKey::Finetuned => "finetuned",
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("model must be 'official' or 'finetuned', got '{s}'"))
    }
}

/// Where the artifacts for one logical model live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model_type: String,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

/// Compute device a model is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}
