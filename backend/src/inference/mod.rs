pub mod engine;
pub mod orchestrator;
pub mod predict;
pub mod preprocess;
pub mod registry;
pub mod saliency;
#[cfg(feature = "torch")]
pub mod torch;

pub use engine::{EvaluationEngine, ModelHandle};
pub use orchestrator::{run_all, run_scan, ScanRun};
pub use predict::predict;
pub use preprocess::{preprocess, InputSize, PreprocessedTensor};
pub use registry::{ModelRegistry, ModelSpec, DEFAULT_MODELS};
pub use saliency::{saliency, SaliencyMap, SaliencyMethod};
