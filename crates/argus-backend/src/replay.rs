//! File-backed backend: replays predictions recorded in a previous run.
//!
//! Accepts both the native and the studio document shape. Records are
//! indexed by location at load time; `infer` resolves immediately, so draw
//! and blur over stored predictions never touch the network.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use argus_formats::convert::studio_to_native;
use argus_formats::native::PredictionRecord;
use argus_formats::{parse_prediction_json, PredictionFile};

use crate::{Backend, BackendError, InferError, PendingResult};

#[derive(Debug)]
pub struct ReplayBackend {
    predictions: HashMap<String, PredictionRecord>,
}

/// Location stem: file name without directories or extension. Lets a frame
/// named `photo_r42` match a record stored under `/data/photo.jpg`.
fn location_stem(location: &str) -> Option<String> {
    Path::new(location)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
}

impl ReplayBackend {
    pub async fn load(path: &Path) -> Result<Self, BackendError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            BackendError::Config(format!(
                "cannot read prediction file '{}': {e}",
                path.display()
            ))
        })?;
        let entries = match parse_prediction_json(&text).map_err(|e| {
            BackendError::Config(format!(
                "invalid prediction file '{}': {e}",
                path.display()
            ))
        })? {
            PredictionFile::Native(entries) => entries,
            PredictionFile::Studio(dataset) => studio_to_native(&dataset),
        };

        let mut predictions = HashMap::new();
        for entry in entries {
            let Some(location) = entry.location.clone() else {
                tracing::warn!("prediction entry without location, skipping");
                continue;
            };
            let record = entry.record();
            if let Some(stem) = location_stem(&location) {
                predictions.entry(stem).or_insert_with(|| record.clone());
            }
            predictions.insert(location, record);
        }
        tracing::info!(
            path = %path.display(),
            locations = predictions.len(),
            "loaded prediction file"
        );
        Ok(Self { predictions })
    }

    fn lookup(&self, frame_name: &str) -> Option<&PredictionRecord> {
        if let Some(record) = self.predictions.get(frame_name) {
            return Some(record);
        }
        // Frame names carry a trailing recognition tag; retry without it.
        let (bare, _) = frame_name.rsplit_once('_')?;
        self.predictions.get(bare)
    }
}

#[async_trait]
impl Backend for ReplayBackend {
    async fn infer(&self, _image: Bytes, frame_name: &str) -> Result<PendingResult, BackendError> {
        let outcome = match self.lookup(frame_name) {
            Some(record) => Ok(record.clone()),
            None => Err(InferError::Failed {
                code: "not_found".into(),
                message: format!("no recorded predictions for frame '{frame_name}'"),
            }),
        };
        Ok(PendingResult::ready(outcome))
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
