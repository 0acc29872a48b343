use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::InferenceError;
use crate::inference::preprocess::preprocess_image;
use crate::inference::{
    run_all, run_scan, saliency, EvaluationEngine, ModelRegistry, ScanRun,
};
use crate::triage;
use shared::{ModelComparison, ModelInfo, ResultMap, SaliencyPayload, ScanId, ScanReport};

/// Request-scoped analysis over a shared registry.
pub struct ScanService {
    registry: ModelRegistry,
    config: AppConfig,
}

impl ScanService {
    pub fn new(registry: ModelRegistry, config: AppConfig) -> Self {
        Self { registry, config }
    }

    pub fn from_config(config: AppConfig, engine: Arc<dyn EvaluationEngine>) -> Self {
        let registry =
            ModelRegistry::new(config.models.root.clone(), engine).with_cache(config.models.cache);
        Self::new(registry, config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn scan_id(image_bytes: &[u8]) -> ScanId {
        let mut hasher = Sha256::new();
        hasher.update(image_bytes);
        ScanId::from(hex::encode(hasher.finalize()))
    }

    pub fn analyze(&self, image_bytes: &[u8]) -> Result<ScanReport, InferenceError> {
        let scan_id = Self::scan_id(image_bytes);
        let run = run_scan(
            &self.registry,
            image_bytes,
            &self.config.models.for_inference,
            &self.config.classes,
        )?;
        let results = &run.results;

        let mut report = ScanReport {
            request_id: Uuid::new_v4().to_string(),
            scan_id,
            created_at: Utc::now().to_rfc3339(),
            results: ResultMap::new(),
            primary_model: None,
            decision: None,
            findings: Vec::new(),
            distribution: Vec::new(),
            saliency: None,
            saliency_unavailable: None,
            prediction_summary: triage::prediction_summary(results),
        };

        let Some((model, prediction)) = results.primary() else {
            log::warn!(
                "No trained models found in {} for scan {}",
                self.registry.root().display(),
                report.scan_id
            );
            return Ok(report);
        };

        let confidence = f64::from(prediction.confidence);
        report.decision = Some(triage::decide(&prediction.label, confidence));
        report.findings = triage::findings_rows(
            &prediction.label,
            confidence,
            results,
            &self.config.classes,
        );
        report.distribution = triage::class_distribution(prediction, &self.config.classes);

        if self.config.saliency.enabled {
            match self.explain(&run, model) {
                Ok(payload) => report.saliency = Some(payload),
                Err(e) => {
                    log::warn!("Saliency unavailable for '{}': {}", model, e);
                    report.saliency_unavailable = Some(e.to_string());
                }
            }
        }

        log::info!(
            "Scan {} analyzed by {} model(s), primary '{}' -> {} ({:.3})",
            report.scan_id,
            results.len(),
            model,
            prediction.label,
            prediction.confidence
        );
        report.primary_model = Some(model.to_string());
        report.results = run.results;
        Ok(report)
    }

    /// Saliency for `model` from the image and handle the run already holds.
    fn explain(&self, run: &ScanRun, model: &str) -> Result<SaliencyPayload, InferenceError> {
        let spec = self.registry.spec(model)?;
        let (Some(image), Some(handle)) = (run.image.as_ref(), run.handle(model)) else {
            return Err(InferenceError::Engine(format!(
                "no decoded scan or handle kept for '{}'",
                model
            )));
        };
        let input = preprocess_image(image, spec.input_size)?;
        let (map, method) = saliency::compute(
            handle.as_ref(),
            &input,
            None,
            self.config.saliency.method,
            self.config.saliency.occlusion,
        )?;
        map.to_payload(model, method)
    }

    /// Every registered model in table order, whether or not it produced a result.
    pub fn compare(&self, image_bytes: &[u8]) -> Result<Vec<ModelComparison>, InferenceError> {
        let names: Vec<String> = self
            .registry
            .specs()
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        let results = run_all(&self.registry, image_bytes, &names, &self.config.classes)?;

        Ok(self
            .registry
            .specs()
            .iter()
            .map(|spec| {
                let available = self.registry.resolve_path(&spec.name).is_ok();
                let result = results.get(&spec.name).cloned();
                let error = match (available, &result) {
                    (false, _) => Some("Model not found".to_string()),
                    (true, None) => Some("Prediction failed".to_string()),
                    (true, Some(_)) => None,
                };
                ModelComparison {
                    model: spec.name.clone(),
                    display_name: spec.display_name.clone(),
                    available,
                    result,
                    error,
                }
            })
            .collect())
    }

    pub fn inventory(&self) -> Vec<ModelInfo> {
        self.registry.inventory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::testing::StubEngine;
    use crate::inference::SaliencyMethod;
    use image::{ImageFormat, Rgb, RgbImage};
    use shared::TriageStatus;
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::tempdir;

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 90]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn touch(dir: &Path, file_name: &str) {
        std::fs::write(dir.join(file_name), b"artifact").unwrap();
    }

    fn service(dir: &Path, engine: StubEngine, config: AppConfig) -> ScanService {
        let registry = ModelRegistry::new(dir, Arc::new(engine));
        ScanService::new(registry, config)
    }

    fn two_model_engine() -> StubEngine {
        StubEngine::new()
            .with_output("custom_cnn", vec![0.95, 0.02, 0.02, 0.01])
            .with_output("xception", vec![0.10, 0.75, 0.10, 0.05])
    }

    #[test]
    fn test_analyze_builds_full_report() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        touch(dir.path(), "xception_best.pt");
        let service = service(dir.path(), two_model_engine(), AppConfig::default());

        let bytes = png_bytes();
        let report = service.analyze(&bytes).unwrap();

        assert_eq!(report.primary_model.as_deref(), Some("custom_cnn"));
        assert_eq!(
            report.results.model_names().collect::<Vec<_>>(),
            vec!["custom_cnn", "xception"]
        );
        let decision = report.decision.as_ref().unwrap();
        assert_eq!(decision.status, TriageStatus::Refer);
        assert_eq!(decision.next_steps[0], "Refer to neuro-oncology for further evaluation");

        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].value, "Glioma (95%)");
        assert_eq!(report.findings[1].value, "No — review models");

        assert_eq!(report.distribution.len(), 4);
        assert!(report.distribution[0].is_primary);
        assert_eq!(
            report.prediction_summary,
            "custom_cnn: glioma (95%); xception: meningioma (75%)"
        );

        let payload = report.saliency.as_ref().unwrap();
        assert_eq!(payload.model, "custom_cnn");
        assert_eq!(payload.method, "gradient");
        assert_eq!((payload.width, payload.height), (224, 224));
        assert_eq!(payload.values.len(), 224 * 224);
        assert!(report.saliency_unavailable.is_none());

        assert_eq!(report.scan_id, ScanService::scan_id(&bytes));
        assert_eq!(report.scan_id.to_string().len(), 64);
        assert!(Uuid::parse_str(&report.request_id).is_ok());
    }

    #[test]
    fn test_analyze_loads_and_decodes_primary_once() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        let engine = Arc::new(two_model_engine());
        let registry = ModelRegistry::new(dir.path(), engine.clone()).with_cache(false);
        let service = ScanService::new(registry, AppConfig::default());

        let report = service.analyze(&png_bytes()).unwrap();
        assert!(report.saliency.is_some());
        assert_eq!(engine.load_count(), 1);
    }

    #[test]
    fn test_analyze_without_artifacts_is_empty() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), two_model_engine(), AppConfig::default());

        let report = service.analyze(&png_bytes()).unwrap();
        assert!(report.results.is_empty());
        assert!(report.primary_model.is_none());
        assert!(report.decision.is_none());
        assert!(report.findings.is_empty());
        assert!(report.distribution.is_empty());
        assert!(report.saliency.is_none());
        assert_eq!(report.prediction_summary, "");
    }

    #[test]
    fn test_saliency_failure_does_not_fail_the_scan() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        let engine = two_model_engine().forward_only();
        let service = service(dir.path(), engine, AppConfig::default());

        let report = service.analyze(&png_bytes()).unwrap();
        assert!(report.decision.is_some());
        assert!(report.saliency.is_none());
        assert!(report
            .saliency_unavailable
            .as_deref()
            .unwrap()
            .contains("unsupported"));
    }

    #[test]
    fn test_auto_saliency_falls_back_to_occlusion() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        let mut config = AppConfig::default();
        config.saliency.method = SaliencyMethod::Auto;
        let service = service(dir.path(), two_model_engine().forward_only(), config);

        let report = service.analyze(&png_bytes()).unwrap();
        assert_eq!(report.saliency.unwrap().method, "occlusion");
    }

    #[test]
    fn test_saliency_disabled() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        let mut config = AppConfig::default();
        config.saliency.enabled = false;
        let service = service(dir.path(), two_model_engine(), config);

        let report = service.analyze(&png_bytes()).unwrap();
        assert!(report.saliency.is_none());
        assert!(report.saliency_unavailable.is_none());
    }

    #[test]
    fn test_analyze_rejects_garbage_when_models_exist() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        let service = service(dir.path(), two_model_engine(), AppConfig::default());

        assert!(matches!(
            service.analyze(b"not an image"),
            Err(InferenceError::Decode(_))
        ));
    }

    #[test]
    fn test_compare_lists_every_registered_model() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "custom_cnn_best.pt");
        touch(dir.path(), "transfer_best.pt");
        let engine = two_model_engine().with_broken("transfer");
        let service = service(dir.path(), engine, AppConfig::default());

        let rows = service.compare(&png_bytes()).unwrap();
        let names: Vec<&str> = rows.iter().map(|row| row.model.as_str()).collect();
        assert_eq!(names, vec!["custom_cnn", "xception", "transfer"]);

        assert!(rows[0].available);
        assert_eq!(rows[0].result.as_ref().unwrap().label, "glioma");
        assert!(rows[0].error.is_none());

        assert!(!rows[1].available);
        assert_eq!(rows[1].error.as_deref(), Some("Model not found"));

        assert!(rows[2].available);
        assert!(rows[2].result.is_none());
        assert_eq!(rows[2].error.as_deref(), Some("Prediction failed"));
    }

    #[test]
    fn test_from_config_uses_models_root() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "xception_best.pt");
        let mut config = AppConfig::default();
        config.models.root = dir.path().to_path_buf();
        let service = ScanService::from_config(config, Arc::new(two_model_engine()));

        let inventory = service.inventory();
        assert_eq!(inventory.len(), 3);
        assert!(!inventory[0].available);
        assert!(inventory[1].available);
        assert_eq!(inventory[1].input_height, 299);
    }
}
