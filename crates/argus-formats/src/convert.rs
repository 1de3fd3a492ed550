//! Conversion between the native and studio shapes.
//!
//! Only the predicted labels of a native record appear in studio output;
//! discarded labels are an internal detail of the native shape. The reverse
//! direction rebuilds native entries with every region as a kept prediction.

use crate::native::{Annotation, BBox, Labels, NativeEntry, Output, PredictionRecord, Roi};
use crate::studio::{
    AnnotatedRegion, RegionType, StudioDataset, StudioImage, StudioRegion,
};

/// Convert one native record to a studio image for the given location.
pub fn record_to_studio_image(location: &str, record: &PredictionRecord) -> StudioImage {
    let mut regions = Vec::new();
    for output in &record.outputs {
        for ann in &output.labels.predicted {
            let (region_type, region) = match &ann.roi {
                Some(roi) => (
                    RegionType::Box,
                    Some(StudioRegion {
                        xmin: roi.bbox.xmin,
                        xmax: roi.bbox.xmax,
                        ymin: roi.bbox.ymin,
                        ymax: roi.bbox.ymax,
                    }),
                ),
                None => (RegionType::Whole, None),
            };
            regions.push(AnnotatedRegion {
                tags: vec![ann.label_name.clone()],
                region_type,
                score: Some(ann.score),
                threshold: ann.threshold,
                region,
            });
        }
    }
    StudioImage {
        location: location.to_string(),
        data: None,
        annotated_regions: regions,
    }
}

/// Convert one native record to a single-image studio dataset.
pub fn record_to_studio(location: &str, record: &PredictionRecord) -> StudioDataset {
    let image = record_to_studio_image(location, record);
    let mut tags = Vec::new();
    for region in &image.annotated_regions {
        for tag in &region.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }
    StudioDataset {
        tags,
        images: vec![image],
    }
}

/// Convert a studio dataset back to native entries, one per image.
pub fn studio_to_native(dataset: &StudioDataset) -> Vec<NativeEntry> {
    dataset
        .images
        .iter()
        .map(|image| {
            let predicted = image
                .annotated_regions
                .iter()
                .map(|region| Annotation {
                    label_id: None,
                    label_name: region.tags.first().cloned().unwrap_or_default(),
                    score: region.score.unwrap_or(1.0),
                    threshold: region.threshold,
                    roi: region.region.as_ref().map(|r| Roi {
                        bbox: BBox {
                            xmin: r.xmin,
                            ymin: r.ymin,
                            xmax: r.xmax,
                            ymax: r.ymax,
                        },
                    }),
                })
                .collect();
            NativeEntry {
                location: Some(image.location.clone()),
                outputs: vec![Output {
                    labels: Labels {
                        predicted,
                        discarded: Vec::new(),
                    },
                }],
            }
        })
        .collect()
}
