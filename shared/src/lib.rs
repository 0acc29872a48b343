use derive_more::{Display, From};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use strum_macros::{AsRefStr, EnumString};

/// Coarse clinical-urgency bucket shown as a status pill next to each finding.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TriageStatus {
    Normal,
    Follow,
    Refer,
    Review,
}

/// SHA-256 of the uploaded scan bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
pub struct ScanId(String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

/// Per-model predictions keyed by model name, in configured model order.
///
/// Models without an artifact are simply absent. On the wire this is a JSON
/// object whose key order follows insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMap {
    entries: Vec<(String, PredictionResult)>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a result; re-inserting an existing model replaces it in place.
    pub fn insert(&mut self, model: impl Into<String>, result: PredictionResult) {
        let model = model.into();
        match self.entries.iter_mut().find(|(name, _)| *name == model) {
            Some((_, existing)) => *existing = result,
            None => self.entries.push((model, result)),
        }
    }

    pub fn get(&self, model: &str) -> Option<&PredictionResult> {
        self.entries
            .iter()
            .find(|(name, _)| name == model)
            .map(|(_, result)| result)
    }

    /// First successfully produced prediction; drives saliency and triage.
    pub fn primary(&self) -> Option<(&str, &PredictionResult)> {
        self.entries
            .first()
            .map(|(name, result)| (name.as_str(), result))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PredictionResult)> {
        self.entries
            .iter()
            .map(|(name, result)| (name.as_str(), result))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ResultMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (model, result) in &self.entries {
            map.serialize_entry(model, result)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResultMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ResultMapVisitor;

        impl<'de> Visitor<'de> for ResultMapVisitor {
            type Value = ResultMap;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of model name to prediction")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ResultMap, A::Error> {
                let mut results = ResultMap::new();
                while let Some((model, result)) =
                    access.next_entry::<String, PredictionResult>()?
                {
                    results.insert(model, result);
                }
                Ok(results)
            }
        }

        deserializer.deserialize_map(ResultMapVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub status: TriageStatus,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRow {
    pub metric: String,
    pub value: String,
    pub status: TriageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub class_name: String,
    pub display_label: String,
    pub probability: f32,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyPayload {
    pub model: String,
    pub method: String,
    pub width: u32,
    pub height: u32,
    /// Row-major, `height * width` values in [0, 1].
    pub values: Vec<f32>,
    pub png_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub request_id: String,
    pub scan_id: ScanId,
    pub created_at: String,
    pub results: ResultMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    pub findings: Vec<FindingRow>,
    pub distribution: Vec<ClassProbability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saliency: Option<SaliencyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saliency_unavailable: Option<String>,
    pub prediction_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    pub input_height: u32,
    pub input_width: u32,
    pub artifact_path: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelComparison {
    pub model: String,
    pub display_name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PredictionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
