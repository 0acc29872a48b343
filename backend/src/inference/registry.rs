use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::engine::{EvaluationEngine, ModelHandle};
use super::preprocess::InputSize;
use crate::error::InferenceError;
use shared::ModelInfo;

/// Static description of one trainable architecture.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub display_name: String,
    pub file_name: String,
    pub input_size: InputSize,
}

impl ModelSpec {
    pub fn new(name: &str, display_name: &str, file_name: &str, input_size: InputSize) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            file_name: file_name.to_string(),
            input_size,
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_MODELS: Vec<ModelSpec> = vec![
        ModelSpec::new("custom_cnn", "Custom CNN", "custom_cnn_best.pt", InputSize::square(224)),
        ModelSpec::new("xception", "Xception", "xception_best.pt", InputSize::square(299)),
        ModelSpec::new("transfer", "Transfer model", "transfer_best.pt", InputSize::square(224)),
    ];
}

type HandleCache = HashMap<String, OnceCell<Arc<dyn ModelHandle>>>;

/// Maps logical model names to artifacts under `root` and loads them.
///
/// With the cache enabled every registered name owns one slot that is filled
/// at most once; concurrent first requests wait for the loader. Missing
/// artifacts are never cached so a freshly trained model is picked up.
pub struct ModelRegistry {
    root: PathBuf,
    specs: Vec<ModelSpec>,
    engine: Arc<dyn EvaluationEngine>,
    cache: Option<HandleCache>,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>, engine: Arc<dyn EvaluationEngine>) -> Self {
        Self::with_specs(root, DEFAULT_MODELS.clone(), engine)
    }

    pub fn with_specs(
        root: impl Into<PathBuf>,
        specs: Vec<ModelSpec>,
        engine: Arc<dyn EvaluationEngine>,
    ) -> Self {
        Self {
            root: root.into(),
            specs,
            engine,
            cache: None,
        }
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(|| {
            self.specs
                .iter()
                .map(|spec| (spec.name.clone(), OnceCell::new()))
                .collect()
        });
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn spec(&self, model_name: &str) -> Result<&ModelSpec, InferenceError> {
        self.specs
            .iter()
            .find(|spec| spec.name == model_name)
            .ok_or_else(|| InferenceError::UnknownModel {
                model: model_name.to_string(),
            })
    }

    pub fn resolve_path(&self, model_name: &str) -> Result<PathBuf, InferenceError> {
        let spec = self.spec(model_name)?;
        let path = self.root.join(&spec.file_name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(InferenceError::NotFound {
                model: model_name.to_string(),
                path,
            })
        }
    }

    /// Loads a fresh handle, bypassing the cache.
    pub fn load(&self, model_name: &str) -> Result<Arc<dyn ModelHandle>, InferenceError> {
        let spec = self.spec(model_name)?;
        let path = self.resolve_path(model_name)?;
        log::info!(
            "Loading model '{}' from {} with {} engine",
            model_name,
            path.display(),
            self.engine.name()
        );

        let handle = self.engine.load(&path, spec)?;
        if handle.input_size() != spec.input_size {
            return Err(InferenceError::ShapeMismatch {
                expected: spec.input_size,
                actual: handle.input_size(),
            });
        }
        Ok(handle)
    }

    /// Loads through the cache when it is enabled.
    pub fn handle(&self, model_name: &str) -> Result<Arc<dyn ModelHandle>, InferenceError> {
        let Some(cache) = &self.cache else {
            return self.load(model_name);
        };
        let slot = cache
            .get(model_name)
            .ok_or_else(|| InferenceError::UnknownModel {
                model: model_name.to_string(),
            })?;
        slot.get_or_try_init(|| self.load(model_name)).cloned()
    }

    pub fn inventory(&self) -> Vec<ModelInfo> {
        self.specs
            .iter()
            .map(|spec| {
                let path = self.root.join(&spec.file_name);
                ModelInfo {
                    name: spec.name.clone(),
                    display_name: spec.display_name.clone(),
                    input_height: spec.input_size.height,
                    input_width: spec.input_size.width,
                    available: path.is_file(),
                    artifact_path: path.display().to_string(),
                }
            })
            .collect()
    }
}
