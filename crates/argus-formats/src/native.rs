use serde::{Deserialize, Serialize};

/// Normalized bounding box, all coordinates in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

/// Region of interest attached to an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub bbox: BBox,
}

/// A single label prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<i64>,
    pub label_name: String,
    pub score: f64,
    /// Per-label decision threshold reported by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi: Option<Roi>,
}

/// Labels split between kept and discarded predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub predicted: Vec<Annotation>,
    #[serde(default)]
    pub discarded: Vec<Annotation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub labels: Labels,
}

/// The canonical prediction record for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub outputs: Vec<Output>,
}

impl PredictionRecord {
    /// A record with one empty output, used when a backend returns nothing.
    pub fn empty() -> Self {
        Self {
            outputs: vec![Output::default()],
        }
    }
}

/// One entry of a native prediction file: a record tied to its source
/// location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub outputs: Vec<Output>,
}

impl NativeEntry {
    pub fn record(&self) -> PredictionRecord {
        PredictionRecord {
            outputs: self.outputs.clone(),
        }
    }
}
