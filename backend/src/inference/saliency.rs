//! Pixel attribution for a single prediction.
//!
//! The gradient method back-propagates the chosen class score to the input
//! (Simonyan et al.), keeping the largest absolute gradient across colour
//! channels. Occlusion is the forward-only alternative for engines that
//! cannot differentiate: a zeroed patch is slid over the scan and the drop in
//! the class probability is credited to the covered pixels.

use base64::Engine;
use image::{GrayImage, ImageFormat, Luma};
use ndarray::{s, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::engine::ModelHandle;
use super::predict::argmax;
use super::preprocess::{InputSize, PreprocessedTensor};
use crate::error::InferenceError;
use shared::SaliencyPayload;

pub const NORMALIZATION_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaliencyMethod {
    #[default]
    Gradient,
    Occlusion,
    /// Gradient, falling back to occlusion when the engine has no gradients.
    Auto,
}

impl SaliencyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaliencyMethod::Gradient => "gradient",
            SaliencyMethod::Occlusion => "occlusion",
            SaliencyMethod::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcclusionWindow {
    pub patch: usize,
    pub stride: usize,
}

impl Default for OcclusionWindow {
    fn default() -> Self {
        Self {
            patch: 32,
            stride: 16,
        }
    }
}

/// `(H, W)` attribution map, min-max normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct SaliencyMap {
    values: Array2<f32>,
}

impl SaliencyMap {
    fn normalized(raw: Array2<f32>) -> Result<Self, InferenceError> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::InvalidOutput(
                "non-finite attribution values".to_string(),
            ));
        }
        let min = raw.iter().copied().fold(f32::INFINITY, f32::min);
        let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min + NORMALIZATION_EPSILON;
        let values = raw.mapv(|v| ((v - min) / range).clamp(0.0, 1.0));
        Ok(Self { values })
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn size(&self) -> InputSize {
        let (height, width) = self.values.dim();
        InputSize::new(height as u32, width as u32)
    }

    /// Grayscale PNG, base64 encoded, for the reporting layer.
    pub fn to_png_base64(&self) -> Result<String, InferenceError> {
        let size = self.size();
        let image = GrayImage::from_fn(size.width, size.height, |x, y| {
            Luma([(self.values[[y as usize, x as usize]] * 255.0).round() as u8])
        });
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| InferenceError::InvalidOutput(format!("saliency png: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(buf))
    }

    pub fn to_payload(
        &self,
        model: &str,
        method: SaliencyMethod,
    ) -> Result<SaliencyPayload, InferenceError> {
        let size = self.size();
        Ok(SaliencyPayload {
            model: model.to_string(),
            method: method.as_str().to_string(),
            width: size.width,
            height: size.height,
            values: self.values.iter().copied().collect(),
            png_base64: self.to_png_base64()?,
        })
    }
}

/// Gradient saliency of the top class, or of `class_index` when given.
pub fn saliency(
    handle: &dyn ModelHandle,
    input: &PreprocessedTensor,
    class_index: Option<usize>,
) -> Result<SaliencyMap, InferenceError> {
    check_input_size(handle, input)?;
    let gradient = handle.input_gradient(input, class_index)?;
    if gradient.dim() != input.as_array().dim() {
        return Err(InferenceError::InvalidOutput(format!(
            "gradient shape {:?} does not match input {:?}",
            gradient.dim(),
            input.as_array().dim()
        )));
    }

    let raw = gradient
        .index_axis(Axis(0), 0)
        .map_axis(Axis(2), |pixel| {
            pixel.iter().fold(0.0f32, |top, g| top.max(g.abs()))
        });
    SaliencyMap::normalized(raw)
}

/// Occlusion attribution; needs only forward passes.
pub fn occlusion(
    handle: &dyn ModelHandle,
    input: &PreprocessedTensor,
    class_index: Option<usize>,
    window: OcclusionWindow,
) -> Result<SaliencyMap, InferenceError> {
    check_input_size(handle, input)?;
    let baseline = handle.forward(input)?;
    let classes = baseline.len();
    let target = match class_index {
        Some(index) if index >= classes => {
            return Err(InferenceError::InvalidClassIndex { index, classes });
        }
        Some(index) => index,
        None => argmax(&baseline)
            .ok_or_else(|| InferenceError::InvalidOutput("empty probability vector".to_string()))?,
    };
    let base_score = baseline[target];

    let (_, height, width, _) = input.as_array().dim();
    let patch = window.patch.max(1);
    let stride = window.stride.max(1);
    let mut heat = Array2::<f32>::zeros((height, width));
    let mut hits = Array2::<f32>::zeros((height, width));

    for top in (0..height).step_by(stride) {
        for left in (0..width).step_by(stride) {
            let (bottom, right) = ((top + patch).min(height), (left + patch).min(width));
            let mut occluded = input.as_array().clone();
            occluded.slice_mut(s![0, top..bottom, left..right, ..]).fill(0.0);

            let scores = handle.forward(&PreprocessedTensor::from_array(occluded)?)?;
            let score = scores.get(target).copied().ok_or_else(|| {
                InferenceError::InvalidOutput("occluded forward lost classes".to_string())
            })?;
            let drop = base_score - score;
            heat.slice_mut(s![top..bottom, left..right])
                .map_inplace(|v| *v += drop);
            hits.slice_mut(s![top..bottom, left..right])
                .map_inplace(|v| *v += 1.0);
        }
    }

    let raw = ndarray::Zip::from(&heat)
        .and(&hits)
        .map_collect(|&total, &count| if count > 0.0 { total / count } else { 0.0 });
    SaliencyMap::normalized(raw)
}

/// Dispatches on `method`; returns the method that actually produced the map.
pub fn compute(
    handle: &dyn ModelHandle,
    input: &PreprocessedTensor,
    class_index: Option<usize>,
    method: SaliencyMethod,
    window: OcclusionWindow,
) -> Result<(SaliencyMap, SaliencyMethod), InferenceError> {
    match method {
        SaliencyMethod::Gradient => Ok((saliency(handle, input, class_index)?, method)),
        SaliencyMethod::Occlusion => Ok((occlusion(handle, input, class_index, window)?, method)),
        SaliencyMethod::Auto => match saliency(handle, input, class_index) {
            Ok(map) => Ok((map, SaliencyMethod::Gradient)),
            Err(InferenceError::GradientUnsupported { engine }) => {
                log::info!("{} engine has no gradients, using occlusion saliency", engine);
                let map = occlusion(handle, input, class_index, window)?;
                Ok((map, SaliencyMethod::Occlusion))
            }
            Err(e) => Err(e),
        },
    }
}

fn check_input_size(
    handle: &dyn ModelHandle,
    input: &PreprocessedTensor,
) -> Result<(), InferenceError> {
    if input.size() != handle.input_size() {
        return Err(InferenceError::ShapeMismatch {
            expected: handle.input_size(),
            actual: input.size(),
        });
    }
    Ok(())
}
