//! Maps a prediction to a triage status, next steps and findings rows.
//!
//! Everything here is deterministic. Confidence is compared as `f64` so a model's
//! `f32` output lands on the same side of each threshold every time.

use shared::{ClassProbability, Decision, FindingRow, PredictionResult, ResultMap, TriageStatus};

pub const NO_TUMOR_NORMAL_MIN: f64 = 0.85;
pub const REFER_MIN: f64 = 0.90;
pub const FOLLOW_MIN: f64 = 0.70;
pub const OVERREAD_BELOW: f64 = 0.80;

pub const OVERREAD_WARNING: &str = "AI confidence moderate — recommend radiologist overread";
pub const AGREEMENT_YES: &str = "Yes";
pub const AGREEMENT_NO: &str = "No — review models";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finding {
    NoTumor,
    Glioma,
    Meningioma,
    Pituitary,
    Unrecognized,
}

impl Finding {
    pub fn from_label(label: &str) -> Self {
        let normalized = normalize_label(label);
        if normalized.contains("notumor") {
            Finding::NoTumor
        } else if normalized.contains("glioma") {
            Finding::Glioma
        } else if normalized.contains("meningioma") {
            Finding::Meningioma
        } else if normalized.contains("pituitary") {
            Finding::Pituitary
        } else {
            Finding::Unrecognized
        }
    }

    fn base_steps(self) -> &'static [&'static str] {
        match self {
            Finding::NoTumor => &[
                "Routine follow-up per clinical indication",
                "No further imaging unless symptoms change",
            ],
            Finding::Glioma => &[
                "Refer to neuro-oncology for further evaluation",
                "Consider contrast MRI and multidisciplinary review",
                "Tissue diagnosis may be indicated per guidelines",
            ],
            Finding::Meningioma => &[
                "Consider neurosurgery referral for size/symptom assessment",
                "Surveillance imaging per institutional protocol",
            ],
            Finding::Pituitary => &[
                "Endocrine and ophthalmology evaluation if not yet done",
                "Consider dedicated pituitary MRI if clinically indicated",
            ],
            Finding::Unrecognized => &[
                "Review AI classification with radiologist",
                "Correlate with clinical history and prior imaging",
            ],
        }
    }
}

/// Lower-case with spaces and underscores removed.
pub fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| *c != ' ' && *c != '_')
        .collect::<String>()
        .to_lowercase()
}

pub fn status(label: &str, confidence: f64) -> TriageStatus {
    if Finding::from_label(label) == Finding::NoTumor {
        return if confidence >= NO_TUMOR_NORMAL_MIN {
            TriageStatus::Normal
        } else {
            TriageStatus::Review
        };
    }
    if confidence >= REFER_MIN {
        TriageStatus::Refer
    } else if confidence >= FOLLOW_MIN {
        TriageStatus::Follow
    } else {
        TriageStatus::Review
    }
}

pub fn next_steps(label: &str, confidence: f64) -> Vec<String> {
    let mut steps = Vec::new();
    if confidence < OVERREAD_BELOW {
        steps.push(OVERREAD_WARNING.to_string());
    }
    steps.extend(
        Finding::from_label(label)
            .base_steps()
            .iter()
            .map(|step| step.to_string()),
    );
    steps
}

pub fn decide(label: &str, confidence: f64) -> Decision {
    Decision {
        status: status(label, confidence),
        next_steps: next_steps(label, confidence),
    }
}

/// Human-readable class name; unknown labels are returned unchanged.
pub fn display_label(label: &str) -> String {
    match normalize_label(label).as_str() {
        "glioma" => "Glioma".to_string(),
        "meningioma" => "Meningioma".to_string(),
        "pituitary" => "Pituitary".to_string(),
        "notumor" => "No tumor".to_string(),
        _ => label.to_string(),
    }
}

/// Whole-number percentage, e.g. `0.934` -> `"93%"`.
pub fn format_percent(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

/// Classification row, plus a model agreement row when several models ran.
///
/// A primary label outside `class_names` still gets a row but is logged, as
/// it means the model and the class list disagree.
pub fn findings_rows(
    primary_label: &str,
    primary_confidence: f64,
    results: &ResultMap,
    class_names: &[String],
) -> Vec<FindingRow> {
    if !class_names.iter().any(|class_name| class_name == primary_label) {
        log::warn!(
            "Primary label '{}' is not among the configured classes {:?}",
            primary_label,
            class_names
        );
    }

    let mut rows = vec![FindingRow {
        metric: "Classification".to_string(),
        value: format!(
            "{} ({})",
            display_label(primary_label),
            format_percent(primary_confidence)
        ),
        status: status(primary_label, primary_confidence),
    }];

    if results.len() > 1 {
        let mut labels = results.iter().map(|(_, result)| result.label.as_str());
        let first = labels.next();
        let agree = labels.all(|label| Some(label) == first);
        rows.push(FindingRow {
            metric: "Model agreement".to_string(),
            value: (if agree { AGREEMENT_YES } else { AGREEMENT_NO }).to_string(),
            status: if agree {
                TriageStatus::Normal
            } else {
                TriageStatus::Review
            },
        });
    }
    rows
}

/// `"<model>: <label> (<pct>)"` per model joined by `"; "`, for the LLM service.
pub fn prediction_summary(results: &ResultMap) -> String {
    results
        .iter()
        .map(|(model, result)| {
            format!(
                "{}: {} ({})",
                model,
                result.label,
                format_percent(f64::from(result.confidence))
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn class_distribution(
    prediction: &PredictionResult,
    class_names: &[String],
) -> Vec<ClassProbability> {
    class_names
        .iter()
        .zip(&prediction.probabilities)
        .map(|(class_name, &probability)| ClassProbability {
            class_name: class_name.clone(),
            display_label: display_label(class_name),
            probability,
            is_primary: *class_name == prediction.label,
        })
        .collect()
}
