use bytes::Bytes;
use image::RgbImage;

use argus_formats::PredictionPayload;

/// A frame as produced by a [`crate::FrameSource`], before it enters the
/// pipeline and receives a frame number.
pub struct SourceFrame {
    /// Display name, derived from the source, sequence index and recognition
    /// tag.
    pub name: String,
    /// Originating resource path or URL.
    pub filename: String,
    /// Decoded RGB8 pixels.
    pub image: RgbImage,
    /// Position within a video source, if applicable.
    pub video_frame_index: Option<u64>,
}

impl SourceFrame {
    pub fn into_frame(self, frame_number: u64) -> Frame {
        Frame {
            name: self.name,
            filename: self.filename,
            image: self.image,
            video_frame_index: self.video_frame_index,
            frame_number,
            encoded: None,
            predictions: None,
            output_image: None,
        }
    }
}

/// The unit of work flowing through the pipeline: one input image or one
/// video frame. Owned by exactly one stage at a time; handoff is the queue
/// put/get.
pub struct Frame {
    pub name: String,
    pub filename: String,
    /// Decoded pixels, retained through the pipeline for draw/blur output.
    pub image: RgbImage,
    pub video_frame_index: Option<u64>,
    /// Monotonic number assigned by the reader; restores input order at the
    /// output stage.
    pub frame_number: u64,
    /// Transport-ready JPEG payload, set by the encode stage.
    pub encoded: Option<Bytes>,
    /// Prediction record, set by the receive stage.
    pub predictions: Option<PredictionPayload>,
    /// Pixels modified by a visual post-processor, set at the output stage.
    pub output_image: Option<RgbImage>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("frame_number", &self.frame_number)
            .field("video_frame_index", &self.video_frame_index)
            .field("size", &(self.image.width(), self.image.height()))
            .field("encoded", &self.encoded.as_ref().map(|b| b.len()))
            .field("has_predictions", &self.predictions.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_frame_carries_fields_into_frame() {
        let src = SourceFrame {
            name: "clip_00003_r42".into(),
            filename: "clip.mp4".into(),
            image: RgbImage::new(4, 4),
            video_frame_index: Some(3),
        };
        let frame = src.into_frame(17);
        assert_eq!(frame.frame_number, 17);
        assert_eq!(frame.video_frame_index, Some(3));
        assert!(frame.encoded.is_none());
        assert!(frame.predictions.is_none());
    }
}
