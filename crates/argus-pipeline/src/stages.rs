//! The encode, send and receive stages.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use argus_backend::{Backend, InferError, PendingResult};
use argus_formats::convert::record_to_studio;
use argus_formats::threshold::partition_record;
use argus_formats::PredictionPayload;
use argus_media::Frame;

use crate::control::Control;
use crate::worker::{StageWorker, Step};
use crate::PipelineError;

/// A frame between the send and receive stages, carrying its backend handle.
/// The handle exists only on this edge of the pipeline.
pub struct InFlight {
    pub frame: Frame,
    pub pending: PendingResult,
}

/// Notifies the output stage of frame numbers that will never arrive, so
/// ordered reassembly can skip over them.
pub type GapSender = mpsc::UnboundedSender<u64>;

/// Encodes the decoded pixels into a JPEG payload. The pixels are kept on
/// the frame for the draw/blur output paths.
pub struct EncoderStage {
    gaps: GapSender,
    ctl: Control,
}

impl EncoderStage {
    pub fn new(gaps: GapSender, ctl: Control) -> Self {
        Self { gaps, ctl }
    }
}

#[async_trait]
impl StageWorker for EncoderStage {
    type In = Frame;
    type Out = Frame;

    async fn process(&mut self, mut frame: Frame) -> Result<Step<Frame>, PipelineError> {
        let mut buf = Vec::new();
        match frame
            .image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
        {
            Ok(()) => {
                frame.encoded = Some(Bytes::from(buf));
                Ok(Step::Emit(frame))
            }
            Err(e) => {
                tracing::warn!(frame = %frame.name, "JPEG encoding failed, dropping frame: {e}");
                let _ = self.gaps.send(frame.frame_number);
                self.ctl.leave_frame();
                Ok(Step::Skip)
            }
        }
    }
}

/// Hands the encoded payload to the backend. Transient transport errors are
/// retried inside the backend; an error surfacing here aborts the run.
pub struct SenderStage {
    backend: Arc<dyn Backend>,
}

impl SenderStage {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StageWorker for SenderStage {
    type In = Frame;
    type Out = InFlight;

    async fn process(&mut self, frame: Frame) -> Result<Step<InFlight>, PipelineError> {
        let Some(encoded) = frame.encoded.clone() else {
            return Err(PipelineError::Other(format!(
                "frame '{}' reached the send stage without a payload",
                frame.name
            )));
        };
        let pending = self.backend.infer(encoded, &frame.name).await?;
        Ok(Step::Emit(InFlight { frame, pending }))
    }
}

/// Awaits backend results with a per-frame deadline, applies the threshold
/// policy and the optional interchange transform. A timeout or a backend
/// failure drops the frame and the run continues.
pub struct ReceiverStage {
    result_timeout: Duration,
    threshold: Option<f64>,
    studio_format: bool,
    gaps: GapSender,
    ctl: Control,
}

impl ReceiverStage {
    pub fn new(
        result_timeout: Duration,
        threshold: Option<f64>,
        studio_format: bool,
        gaps: GapSender,
        ctl: Control,
    ) -> Self {
        Self {
            result_timeout,
            threshold,
            studio_format,
            gaps,
            ctl,
        }
    }

    fn drop_frame(&mut self, frame: &Frame) {
        let _ = self.gaps.send(frame.frame_number);
        self.ctl.leave_frame();
    }
}

#[async_trait]
impl StageWorker for ReceiverStage {
    type In = InFlight;
    type Out = Frame;

    async fn process(&mut self, msg: InFlight) -> Result<Step<Frame>, PipelineError> {
        let InFlight { mut frame, pending } = msg;
        match pending.wait(self.result_timeout).await {
            Ok(mut record) => {
                // Threshold partitioning always precedes the interchange
                // transform, so the studio document only carries survivors.
                partition_record(&mut record, self.threshold);
                frame.predictions = Some(if self.studio_format {
                    PredictionPayload::Studio(record_to_studio(&frame.name, &record))
                } else {
                    PredictionPayload::Native(record)
                });
                Ok(Step::Emit(frame))
            }
            Err(InferError::Timeout(t)) => {
                tracing::warn!(frame = %frame.name, "inference timed out after {t:?}, dropping frame");
                self.drop_frame(&frame);
                Ok(Step::Skip)
            }
            Err(InferError::Failed { code, message }) => {
                tracing::warn!(frame = %frame.name, %code, "inference failed, dropping frame: {message}");
                self.drop_frame(&frame);
                Ok(Step::Skip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_formats::native::{Annotation, Labels, Output, PredictionRecord};
    use image::RgbImage;

    fn frame(number: u64) -> Frame {
        Frame {
            name: format!("f{number}_"),
            filename: "mem".into(),
            image: RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3])),
            video_frame_index: None,
            frame_number: number,
            encoded: None,
            predictions: None,
            output_image: None,
        }
    }

    fn record_with_scores() -> PredictionRecord {
        PredictionRecord {
            outputs: vec![Output {
                labels: Labels {
                    predicted: vec![
                        Annotation {
                            label_id: None,
                            label_name: "high".into(),
                            score: 0.9,
                            threshold: Some(0.5),
                            roi: None,
                        },
                        Annotation {
                            label_id: None,
                            label_name: "low".into(),
                            score: 0.2,
                            threshold: Some(0.5),
                            roi: None,
                        },
                    ],
                    discarded: vec![],
                },
            }],
        }
    }

    #[tokio::test]
    async fn encoder_attaches_a_jpeg_payload() {
        let ctl = Control::new();
        let (gap_tx, _gap_rx) = mpsc::unbounded_channel();
        let mut stage = EncoderStage::new(gap_tx, ctl);

        match stage.process(frame(0)).await.unwrap() {
            Step::Emit(out) => {
                let payload = out.encoded.expect("payload missing");
                // JPEG SOI marker.
                assert_eq!(&payload[..2], &[0xFF, 0xD8]);
            }
            _ => panic!("expected emit"),
        }
    }

    #[tokio::test]
    async fn receiver_partitions_and_forwards() {
        let ctl = Control::new();
        ctl.enter_frame();
        let (gap_tx, _gap_rx) = mpsc::unbounded_channel();
        let mut stage = ReceiverStage::new(
            Duration::from_secs(1),
            None,
            false,
            gap_tx,
            ctl,
        );

        let msg = InFlight {
            frame: frame(0),
            pending: PendingResult::ready(Ok(record_with_scores())),
        };
        match stage.process(msg).await.unwrap() {
            Step::Emit(out) => match out.predictions.unwrap() {
                PredictionPayload::Native(record) => {
                    let labels = &record.outputs[0].labels;
                    assert_eq!(labels.predicted.len(), 1);
                    assert_eq!(labels.predicted[0].label_name, "high");
                    assert_eq!(labels.discarded.len(), 1);
                }
                PredictionPayload::Studio(_) => panic!("expected native payload"),
            },
            _ => panic!("expected emit"),
        }
    }

    #[tokio::test]
    async fn receiver_studio_transform_runs_after_partitioning() {
        let ctl = Control::new();
        ctl.enter_frame();
        let (gap_tx, _gap_rx) = mpsc::unbounded_channel();
        let mut stage = ReceiverStage::new(
            Duration::from_secs(1),
            None,
            true,
            gap_tx,
            ctl,
        );

        let msg = InFlight {
            frame: frame(0),
            pending: PendingResult::ready(Ok(record_with_scores())),
        };
        match stage.process(msg).await.unwrap() {
            Step::Emit(out) => match out.predictions.unwrap() {
                PredictionPayload::Studio(dataset) => {
                    // Only the surviving annotation is exported.
                    assert_eq!(dataset.images[0].annotated_regions.len(), 1);
                    assert_eq!(dataset.tags, vec!["high"]);
                }
                PredictionPayload::Native(_) => panic!("expected studio payload"),
            },
            _ => panic!("expected emit"),
        }
    }

    #[tokio::test]
    async fn receiver_drops_failed_frames_and_reports_the_gap() {
        let ctl = Control::new();
        ctl.enter_frame();
        let (gap_tx, mut gap_rx) = mpsc::unbounded_channel();
        let mut stage = ReceiverStage::new(
            Duration::from_secs(1),
            None,
            false,
            gap_tx,
            ctl.clone(),
        );

        let msg = InFlight {
            frame: frame(7),
            pending: PendingResult::ready(Err(InferError::Failed {
                code: "worker_error".into(),
                message: "boom".into(),
            })),
        };
        assert!(matches!(stage.process(msg).await.unwrap(), Step::Skip));
        assert_eq!(gap_rx.try_recv().unwrap(), 7);
        assert_eq!(ctl.in_flight(), 0);
    }
}
