use image::DynamicImage;
use once_cell::unsync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

use super::engine::ModelHandle;
use super::predict::predict;
use super::preprocess::{decode, preprocess_image};
use super::registry::ModelRegistry;
use crate::error::InferenceError;
use shared::{PredictionResult, ResultMap};

/// Results of one scan plus the decoded image and the handles that produced
/// them, so follow-up work on the same scan needs no second decode or load.
pub struct ScanRun {
    pub results: ResultMap,
    pub image: Option<DynamicImage>,
    handles: HashMap<String, Arc<dyn ModelHandle>>,
}

impl ScanRun {
    /// Handle of a model that contributed to `results`.
    pub fn handle(&self, model_name: &str) -> Option<&Arc<dyn ModelHandle>> {
        self.handles.get(model_name)
    }
}

/// Runs every configured model on one upload, in configured order.
///
/// Models without an artifact are skipped. The image is decoded only once a
/// model is actually available, so an empty artifact store yields an empty
/// map whatever the bytes are. Decode failures and contract violations abort
/// the request; any other per-model failure is logged and skipped.
pub fn run_all(
    registry: &ModelRegistry,
    image_bytes: &[u8],
    model_names: &[String],
    class_names: &[String],
) -> Result<ResultMap, InferenceError> {
    run_scan(registry, image_bytes, model_names, class_names).map(|run| run.results)
}

/// Same as [`run_all`], keeping the decoded image and the contributing handles.
pub fn run_scan(
    registry: &ModelRegistry,
    image_bytes: &[u8],
    model_names: &[String],
    class_names: &[String],
) -> Result<ScanRun, InferenceError> {
    let mut results = ResultMap::new();
    let mut handles = HashMap::new();
    let image: OnceCell<DynamicImage> = OnceCell::new();

    for model_name in model_names {
        if let Err(e) = registry.resolve_path(model_name) {
            if e.is_not_found() {
                log::debug!("Skipping model '{}': {}", model_name, e);
                continue;
            }
            return Err(e);
        }

        let decoded = image.get_or_try_init(|| decode(image_bytes))?;

        match run_one(registry, decoded, model_name, class_names) {
            Ok((result, handle)) => {
                log::info!(
                    "Model '{}' predicted {} ({:.1}%)",
                    model_name,
                    result.label,
                    result.confidence * 100.0
                );
                results.insert(model_name.clone(), result);
                handles.insert(model_name.clone(), handle);
            }
            Err(e) if e.is_not_found() => {
                log::debug!("Skipping model '{}': {}", model_name, e);
            }
            Err(e) if e.is_contract_violation() => return Err(e),
            Err(e) => {
                log::error!("Model '{}' failed, continuing without it: {}", model_name, e);
            }
        }
    }

    Ok(ScanRun {
        results,
        image: image.into_inner(),
        handles,
    })
}

fn run_one(
    registry: &ModelRegistry,
    image: &DynamicImage,
    model_name: &str,
    class_names: &[String],
) -> Result<(PredictionResult, Arc<dyn ModelHandle>), InferenceError> {
    let spec = registry.spec(model_name)?;
    let handle = registry.handle(model_name)?;
    let input = preprocess_image(image, spec.input_size)?;
    let result = predict(handle.as_ref(), &input, class_names)?;
    Ok((result, handle))
}
