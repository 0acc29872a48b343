use super::engine::ModelHandle;
use super::preprocess::PreprocessedTensor;
use crate::error::InferenceError;
use shared::PredictionResult;

/// Allowed distance of the probability sum from 1.
pub const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// Index of the highest score; the first one wins on ties.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index)
}

/// Runs one model on one tensor and picks the top class.
pub fn predict(
    handle: &dyn ModelHandle,
    input: &PreprocessedTensor,
    class_names: &[String],
) -> Result<PredictionResult, InferenceError> {
    let expected = handle.input_size();
    if input.size() != expected {
        return Err(InferenceError::ShapeMismatch {
            expected,
            actual: input.size(),
        });
    }

    let probabilities = handle.forward(input)?;
    if probabilities.len() != class_names.len() {
        return Err(InferenceError::ClassCountMismatch {
            expected: class_names.len(),
            actual: probabilities.len(),
        });
    }
    if let Some(bad) = probabilities.iter().find(|p| !p.is_finite()) {
        return Err(InferenceError::InvalidOutput(format!(
            "non-finite probability {}",
            bad
        )));
    }
    if let Some(bad) = probabilities.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(InferenceError::InvalidOutput(format!(
            "probability {} outside [0, 1]; expected softmax output",
            bad
        )));
    }
    let total: f32 = probabilities.iter().sum();
    if (total - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
        return Err(InferenceError::InvalidOutput(format!(
            "probabilities sum to {}, expected 1",
            total
        )));
    }

    let index = argmax(&probabilities)
        .ok_or_else(|| InferenceError::InvalidOutput("empty probability vector".to_string()))?;

    Ok(PredictionResult {
        label: class_names[index].clone(),
        confidence: probabilities[index],
        probabilities,
    })
}
