// Prediction data model for argus.
//
// Two equivalent JSON shapes flow through the tool:
// - native.rs: the canonical in-memory shape produced by recognition backends
// - studio.rs: the interchange shape used by manifests and exported datasets
// - convert.rs: lossless-on-shared-fields conversion between the two
// - threshold.rs: score partitioning between predicted and discarded labels

pub mod convert;
pub mod native;
pub mod studio;
pub mod threshold;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a recognized prediction document: {0}")]
    Schema(String),
}

/// A parsed prediction file, either shape.
#[derive(Debug, Clone)]
pub enum PredictionFile {
    Native(Vec<native::NativeEntry>),
    Studio(studio::StudioDataset),
}

/// Parse a prediction document, detecting its shape.
///
/// Native documents are JSON arrays of `{location?, outputs}` entries; studio
/// documents are objects with `images` (and usually `tags`). Anything else is
/// a schema error.
pub fn parse_prediction_json(text: &str) -> Result<PredictionFile, FormatError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value {
        serde_json::Value::Array(_) => {
            let entries: Vec<native::NativeEntry> = serde_json::from_value(value)
                .map_err(|e| FormatError::Schema(format!("native document: {e}")))?;
            Ok(PredictionFile::Native(entries))
        }
        serde_json::Value::Object(ref map) if map.contains_key("images") => {
            let dataset: studio::StudioDataset = serde_json::from_value(value)
                .map_err(|e| FormatError::Schema(format!("studio document: {e}")))?;
            Ok(PredictionFile::Studio(dataset))
        }
        _ => Err(FormatError::Schema(
            "expected a native array or a studio object with an `images` key".into(),
        )),
    }
}

/// Predictions attached to a frame. Backends always produce the native shape;
/// the studio variant appears after the optional interchange transform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionPayload {
    Native(native::PredictionRecord),
    Studio(studio::StudioDataset),
}

/// A region extracted from either payload shape, ready for drawing or
/// blurring. `bbox` is absent for whole-image labels.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRegion {
    pub label: String,
    pub score: Option<f64>,
    pub bbox: Option<native::BBox>,
}

impl PredictionPayload {
    /// Flatten the payload into drawable regions, whichever shape it holds.
    pub fn regions(&self) -> Vec<DrawRegion> {
        match self {
            PredictionPayload::Native(record) => record
                .outputs
                .iter()
                .flat_map(|o| o.labels.predicted.iter())
                .map(|a| DrawRegion {
                    label: a.label_name.clone(),
                    score: Some(a.score),
                    bbox: a.roi.as_ref().map(|r| r.bbox.clone()),
                })
                .collect(),
            PredictionPayload::Studio(dataset) => dataset
                .images
                .iter()
                .flat_map(|img| img.annotated_regions.iter())
                .map(|r| DrawRegion {
                    label: r.tags.join(", "),
                    score: r.score,
                    bbox: r.region.as_ref().map(|b| native::BBox {
                        xmin: b.xmin,
                        ymin: b.ymin,
                        xmax: b.xmax,
                        ymax: b.ymax,
                    }),
                })
                .collect(),
        }
    }
}
