use ndarray::Array4;
use std::path::Path;
use std::sync::Arc;

use super::preprocess::{InputSize, PreprocessedTensor};
use super::registry::ModelSpec;
use crate::error::InferenceError;

/// A loaded classifier. Read-only once loaded; shared across requests.
pub trait ModelHandle: Send + Sync {
    fn input_size(&self) -> InputSize;

    /// Class probabilities for a single-image batch.
    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError>;

    /// Gradient of the chosen class score (the top score when `class_index`
    /// is `None`) with respect to the input, shaped like the input.
    fn input_gradient(
        &self,
        input: &PreprocessedTensor,
        class_index: Option<usize>,
    ) -> Result<Array4<f32>, InferenceError> {
        let _ = (input, class_index);
        Err(InferenceError::GradientUnsupported {
            engine: "forward-only",
        })
    }
}

/// Numeric framework that turns model artifacts into handles.
pub trait EvaluationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, path: &Path, spec: &ModelSpec) -> Result<Arc<dyn ModelHandle>, InferenceError>;
}
