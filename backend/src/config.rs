use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::inference::saliency::{OcclusionWindow, SaliencyMethod};

pub const DEFAULT_CONFIG_PATH: &str = "config/app.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    /// Must line up with every model's output vector.
    pub classes: Vec<String>,
    pub saliency: SaliencyConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub root: PathBuf,
    pub for_inference: Vec<String>,
    pub cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    pub enabled: bool,
    pub method: SaliencyMethod,
    pub occlusion: OcclusionWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub timeout_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            models: ModelsConfig::default(),
            classes: ["glioma", "meningioma", "notumor", "pituitary"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            saliency: SaliencyConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models/saved"),
            for_inference: ["custom_cnn", "xception", "transfer"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cache: true,
        }
    }
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: SaliencyMethod::Gradient,
            occlusion: OcclusionWindow::default(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    /// Reads a YAML file; a missing file means defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// `MRI_CONFIG` picks the file, then `PORT` / `MODELS_ROOT` /
    /// `MODELS_FOR_INFERENCE` override it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("MRI_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT '{}' is not a port number", port)))?;
        }
        if let Some(root) = lookup("MODELS_ROOT") {
            self.models.root = PathBuf::from(root);
        }
        if let Some(models) = lookup("MODELS_FOR_INFERENCE") {
            self.models.for_inference = models
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classes.is_empty() {
            return Err(ConfigError::Invalid("classes must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = self.classes.iter().find(|class| !seen.insert(class.as_str())) {
            return Err(ConfigError::Invalid(format!("duplicate class '{}'", duplicate)));
        }
        if self.inference.timeout_secs == 0 {
            return Err(ConfigError::Invalid("inference.timeout_secs must be positive".to_string()));
        }
        if self.inference.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "inference.max_upload_bytes must be positive".to_string(),
            ));
        }
        if self.saliency.occlusion.patch == 0 || self.saliency.occlusion.stride == 0 {
            return Err(ConfigError::Invalid(
                "saliency.occlusion patch and stride must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
