use ndarray::Array4;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tch::{CModule, Device, Kind, Tensor};

use super::engine::{EvaluationEngine, ModelHandle};
use super::preprocess::{InputSize, PreprocessedTensor};
use super::registry::ModelSpec;
use crate::error::InferenceError;

/// Loads TorchScript artifacts with libtorch, on CUDA when available.
pub struct TorchEngine {
    device: Device,
}

impl TorchEngine {
    pub fn new() -> Self {
        Self {
            device: Device::cuda_if_available(),
        }
    }

    /// Eval-mode module with frozen parameters.
    fn load_module(&self, path: &Path, spec: &ModelSpec) -> Result<CModule, InferenceError> {
        let load_error = |e: tch::TchError| InferenceError::Load {
            model: spec.name.clone(),
            reason: e.to_string(),
        };
        let mut module = CModule::load_on_device(path, self.device).map_err(load_error)?;
        module.set_eval();
        freeze_parameters(&module).map_err(load_error)?;
        Ok(module)
    }
}

impl Default for TorchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationEngine for TorchEngine {
    fn name(&self) -> &'static str {
        "torch"
    }

    fn load(&self, path: &Path, spec: &ModelSpec) -> Result<Arc<dyn ModelHandle>, InferenceError> {
        let module = self.load_module(path, spec)?;
        log::info!("Loaded '{}' on {:?}", spec.name, self.device);

        Ok(Arc::new(TorchModel {
            module: Mutex::new(module),
            device: self.device,
            input_size: spec.input_size,
        }))
    }
}

/// Input gradients must not accumulate into the weights.
fn freeze_parameters(module: &CModule) -> Result<(), tch::TchError> {
    for (_, parameter) in module.named_parameters()? {
        let _ = parameter.set_requires_grad(false);
    }
    Ok(())
}

/// TorchScript classifier taking NHWC float input and returning probabilities.
pub struct TorchModel {
    module: Mutex<CModule>,
    device: Device,
    input_size: InputSize,
}

impl TorchModel {
    fn module(&self) -> Result<MutexGuard<'_, CModule>, InferenceError> {
        self.module
            .lock()
            .map_err(|_| InferenceError::Engine("torch module lock poisoned".to_string()))
    }

    fn to_tensor(&self, input: &PreprocessedTensor) -> Result<Tensor, InferenceError> {
        let array = input.as_array().as_standard_layout();
        let data = array
            .as_slice()
            .ok_or_else(|| InferenceError::InvalidTensor("non-contiguous input".to_string()))?;
        let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
        Ok(Tensor::from_slice(data).view(shape.as_slice()).to_device(self.device))
    }
}

fn to_vec(tensor: &Tensor) -> Vec<f32> {
    let flat = tensor
        .to_kind(Kind::Float)
        .to_device(Device::Cpu)
        .contiguous()
        .view([-1]);
    let num_elements = flat.size()[0] as usize;
    let mut values = vec![0.0f32; num_elements];
    flat.copy_data(&mut values, num_elements);
    values
}

impl ModelHandle for TorchModel {
    fn input_size(&self) -> InputSize {
        self.input_size
    }

    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
        let tensor = self.to_tensor(input)?;
        let module = self.module()?;
        let output = tch::no_grad(|| module.forward_ts(&[&tensor]))?;
        Ok(to_vec(&output))
    }

    fn input_gradient(
        &self,
        input: &PreprocessedTensor,
        class_index: Option<usize>,
    ) -> Result<Array4<f32>, InferenceError> {
        let tensor = self.to_tensor(input)?.set_requires_grad(true);
        let module = self.module()?;
        let output = module.forward_ts(&[&tensor])?;

        let scores = output.get(0);
        let classes = scores.size().first().copied().unwrap_or(0) as usize;
        let score = match class_index {
            Some(index) if index >= classes => {
                return Err(InferenceError::InvalidClassIndex { index, classes });
            }
            Some(index) => scores.get(index as i64),
            None => scores.max(),
        };
        score.backward();

        let gradient = tensor.grad();
        if !gradient.defined() {
            return Err(InferenceError::GradientUnsupported { engine: "torch" });
        }
        Array4::from_shape_vec(input.as_array().dim(), to_vec(&gradient))
            .map_err(|e| InferenceError::InvalidOutput(format!("gradient layout: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Three-class model: softmax over per-channel means, saved as TorchScript.
    fn channel_mean_artifact(path: &Path) {
        let example = Tensor::rand([1, 6, 6, 3], (Kind::Float, Device::Cpu));
        let module = CModule::create_by_tracing("channel_mean", "forward", &[example], &mut |inputs| {
            vec![inputs[0]
                .mean_dim([1i64, 2].as_slice(), false, Kind::Float)
                .softmax(-1, Kind::Float)]
        })
        .unwrap();
        module.save(path).unwrap();
    }

    fn uniform(side: usize, value: f32) -> PreprocessedTensor {
        PreprocessedTensor::from_array(Array4::from_elem((1, side, side, 3), value)).unwrap()
    }

    #[test]
    fn test_loaded_module_stays_frozen_across_gradients() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channel_mean.pt");
        channel_mean_artifact(&path);

        let engine = TorchEngine {
            device: Device::Cpu,
        };
        let spec = ModelSpec::new("channel_mean", "Channel mean", "channel_mean.pt", InputSize::square(6));
        let handle = engine.load(&path, &spec).unwrap();

        let probabilities = handle.forward(&uniform(6, 0.5)).unwrap();
        assert_eq!(probabilities.len(), 3);
        assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);

        let first = handle.input_gradient(&uniform(6, 0.5), Some(0)).unwrap();
        let second = handle.input_gradient(&uniform(6, 0.5), Some(0)).unwrap();
        assert_eq!(first, second);

        let module = engine.load_module(&path, &spec).unwrap();
        for (_, parameter) in module.named_parameters().unwrap() {
            assert!(!parameter.requires_grad());
        }
    }

    #[test]
    fn test_gradient_rejects_bad_class_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channel_mean.pt");
        channel_mean_artifact(&path);

        let engine = TorchEngine {
            device: Device::Cpu,
        };
        let spec = ModelSpec::new("channel_mean", "Channel mean", "channel_mean.pt", InputSize::square(6));
        let handle = engine.load(&path, &spec).unwrap();
        assert!(matches!(
            handle.input_gradient(&uniform(6, 0.5), Some(5)),
            Err(InferenceError::InvalidClassIndex { index: 5, classes: 3 })
        ));
    }
}
