use serde::{Deserialize, Serialize};

/// Region coordinates in the studio shape. Same normalized space as
/// [`crate::native::BBox`], different field order on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioRegion {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionType {
    Box,
    Whole,
}

/// One annotated region of a studio image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedRegion {
    pub tags: Vec<String>,
    pub region_type: RegionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<StudioRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioImage {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub annotated_regions: Vec<AnnotatedRegion>,
}

/// The studio interchange document: a flat tag list plus per-image regions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudioDataset {
    #[serde(default)]
    pub tags: Vec<String>,
    pub images: Vec<StudioImage>,
}

impl StudioDataset {
    /// Fold another dataset into this one, keeping tags unique and in first
    /// appearance order.
    pub fn merge(&mut self, other: StudioDataset) {
        for tag in other.tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self.images.extend(other.images);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_type_serializes_capitalized() {
        assert_eq!(serde_json::to_string(&RegionType::Box).unwrap(), "\"Box\"");
        assert_eq!(
            serde_json::to_string(&RegionType::Whole).unwrap(),
            "\"Whole\""
        );
    }

    #[test]
    fn manifest_without_regions_parses() {
        let text = r#"{"images": [{"location": "/tmp/a.jpg"}]}"#;
        let dataset: StudioDataset = serde_json::from_str(text).unwrap();
        assert_eq!(dataset.images[0].location, "/tmp/a.jpg");
        assert!(dataset.images[0].annotated_regions.is_empty());
        assert!(dataset.tags.is_empty());
    }

    #[test]
    fn merge_deduplicates_tags_and_appends_images() {
        let mut a: StudioDataset =
            serde_json::from_str(r#"{"tags": ["cat"], "images": [{"location": "a.jpg"}]}"#)
                .unwrap();
        let b: StudioDataset = serde_json::from_str(
            r#"{"tags": ["cat", "dog"], "images": [{"location": "b.jpg"}]}"#,
        )
        .unwrap();
        a.merge(b);
        assert_eq!(a.tags, vec!["cat", "dog"]);
        assert_eq!(a.images.len(), 2);
    }
}
