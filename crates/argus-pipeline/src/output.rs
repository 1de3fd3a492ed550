//! The output stage: ordered reassembly, visual post-processing, sinks.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::mpsc;

use argus_media::{BlurOverlay, DrawOverlay, Frame, FrameSink, SinkAction};

use crate::control::Control;
use crate::progress::Progress;
use crate::worker::{StageWorker, Step};
use crate::PipelineError;

/// Visual transform applied to each emitted frame.
pub enum PostProcessor {
    /// Predictions only, no pixel output (infer mode).
    None,
    /// Pass the original pixels through unchanged (noop mode).
    Passthrough,
    Draw(DrawOverlay),
    Blur(BlurOverlay),
}

impl PostProcessor {
    fn render(&self, frame: &Frame) -> Option<image::RgbImage> {
        match self {
            PostProcessor::None => None,
            PostProcessor::Passthrough => Some(frame.image.clone()),
            PostProcessor::Draw(overlay) => {
                Some(overlay.apply(&frame.image, frame.predictions.as_ref()))
            }
            PostProcessor::Blur(overlay) => {
                Some(overlay.apply(&frame.image, frame.predictions.as_ref()))
            }
        }
    }
}

/// Restores input order and writes every frame to every sink.
///
/// Out-of-order arrivals (the sender pool races) are buffered in
/// `frames_done` until their turn; its size is naturally bounded by the
/// sender pool size plus the downstream queue capacities. Frames dropped
/// upstream announce their numbers on the gap channel so ordering never
/// stalls on a frame that will not arrive.
pub struct OutputterStage {
    sinks: Vec<Box<dyn FrameSink>>,
    post: PostProcessor,
    /// Strict ordering for finite inputs; infinite inputs emit whatever
    /// survives the drop policy, still in increasing order.
    ordered: bool,
    frame_to_output: u64,
    frames_done: HashMap<u64, Frame>,
    gaps: mpsc::UnboundedReceiver<u64>,
    gap_set: BTreeSet<u64>,
    progress: Progress,
    ctl: Control,
}

impl OutputterStage {
    pub fn new(
        sinks: Vec<Box<dyn FrameSink>>,
        post: PostProcessor,
        ordered: bool,
        gaps: mpsc::UnboundedReceiver<u64>,
        progress: Progress,
        ctl: Control,
    ) -> Self {
        Self {
            sinks,
            post,
            ordered,
            frame_to_output: 0,
            frames_done: HashMap::new(),
            gaps,
            gap_set: BTreeSet::new(),
            progress,
            ctl,
        }
    }

    /// Number of frames parked in the reorder buffer.
    pub fn buffered(&self) -> usize {
        self.frames_done.len()
    }

    fn collect_gaps(&mut self) {
        while let Ok(number) = self.gaps.try_recv() {
            self.gap_set.insert(number);
        }
    }

    async fn emit(&mut self, mut frame: Frame) {
        frame.output_image = self.post.render(&frame);

        for sink in &mut self.sinks {
            match sink.write(&frame).await {
                Ok(SinkAction::Continue) => {}
                Ok(SinkAction::Stop) => {
                    tracing::info!(sink = sink.describe(), "sink requested stop");
                    self.ctl.request_drain();
                }
                // A failing sink loses its frame; the remaining sinks still
                // receive it.
                Err(e) => {
                    tracing::error!(sink = sink.describe(), "write failed: {e}");
                }
            }
        }

        self.ctl.leave_frame();
        self.progress.advance();
    }

    /// Emit every frame that is now in order: buffered arrivals and
    /// announced gaps both advance the cursor.
    async fn flush_ready(&mut self) {
        loop {
            if self.gap_set.remove(&self.frame_to_output) {
                self.frame_to_output += 1;
                continue;
            }
            if let Some(frame) = self.frames_done.remove(&self.frame_to_output) {
                self.frame_to_output += 1;
                self.emit(frame).await;
                continue;
            }
            return;
        }
    }
}

#[async_trait]
impl StageWorker for OutputterStage {
    type In = Frame;
    type Out = Frame;

    async fn process(&mut self, frame: Frame) -> Result<Step<Frame>, PipelineError> {
        self.collect_gaps();

        if !self.ordered {
            // Infinite inputs: stale frames were dropped upstream, emit the
            // survivors as they come but never go backwards.
            if frame.frame_number >= self.frame_to_output {
                self.frame_to_output = frame.frame_number + 1;
                self.emit(frame).await;
            } else {
                tracing::trace!(number = frame.frame_number, "discarding stale frame");
                self.ctl.leave_frame();
            }
            return Ok(Step::Skip);
        }

        self.frames_done.insert(frame.frame_number, frame);
        self.flush_ready().await;
        Ok(Step::Skip)
    }

    async fn close(&mut self) {
        self.collect_gaps();
        self.flush_ready().await;

        // Anything still parked here lost its predecessors to an abnormal
        // stop; emit it in order rather than silently dropping it.
        if !self.frames_done.is_empty() && self.ctl.level() != crate::StopLevel::Hard {
            tracing::warn!(
                buffered = self.frames_done.len(),
                "emitting out-of-sequence tail frames"
            );
            let mut numbers: Vec<u64> = self.frames_done.keys().copied().collect();
            numbers.sort_unstable();
            for number in numbers {
                if let Some(frame) = self.frames_done.remove(&number) {
                    self.emit(frame).await;
                }
            }
        }

        for sink in &mut self.sinks {
            if let Err(e) = sink.close().await {
                tracing::error!(sink = sink.describe(), "close failed: {e}");
            }
        }
        self.progress.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_media::MediaError;
    use image::RgbImage;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        numbers: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
            self.numbers.lock().unwrap().push(frame.frame_number);
            Ok(SinkAction::Continue)
        }

        async fn close(&mut self) -> Result<(), MediaError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".into()
        }
    }

    fn frame(number: u64) -> Frame {
        Frame {
            name: format!("f{number}_"),
            filename: "mem".into(),
            image: RgbImage::new(2, 2),
            video_frame_index: None,
            frame_number: number,
            encoded: None,
            predictions: None,
            output_image: None,
        }
    }

    fn outputter(
        ordered: bool,
    ) -> (
        OutputterStage,
        Arc<Mutex<Vec<u64>>>,
        mpsc::UnboundedSender<u64>,
        Control,
    ) {
        let numbers = Arc::new(Mutex::new(Vec::new()));
        let (gap_tx, gap_rx) = mpsc::unbounded_channel();
        let ctl = Control::new();
        let stage = OutputterStage::new(
            vec![Box::new(RecordingSink {
                numbers: numbers.clone(),
            })],
            PostProcessor::Passthrough,
            ordered,
            gap_rx,
            Progress::hidden(),
            ctl.clone(),
        );
        (stage, numbers, gap_tx, ctl)
    }

    #[tokio::test]
    async fn out_of_order_arrivals_are_reassembled() {
        let (mut stage, numbers, _gap_tx, ctl) = outputter(true);
        for (i, n) in [2, 0, 1, 4, 3].into_iter().enumerate() {
            ctl.enter_frame();
            stage.process(frame(n)).await.unwrap();
            // The reorder buffer never holds more than the arrival disorder.
            assert!(stage.buffered() <= i + 1);
        }
        assert_eq!(*numbers.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(stage.buffered(), 0);
    }

    #[tokio::test]
    async fn gaps_do_not_stall_the_cursor() {
        let (mut stage, numbers, gap_tx, ctl) = outputter(true);
        ctl.enter_frame();
        stage.process(frame(0)).await.unwrap();

        // Frame 1 was dropped upstream; 2 and 3 still flow.
        gap_tx.send(1).unwrap();
        for n in [2, 3] {
            ctl.enter_frame();
            stage.process(frame(n)).await.unwrap();
        }
        assert_eq!(*numbers.lock().unwrap(), vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn unordered_mode_emits_survivors_in_increasing_order() {
        let (mut stage, numbers, _gap_tx, ctl) = outputter(false);
        for n in [0, 5, 3, 9] {
            ctl.enter_frame();
            stage.process(frame(n)).await.unwrap();
        }
        // 3 arrived after 5 and is stale.
        assert_eq!(*numbers.lock().unwrap(), vec![0, 5, 9]);
    }

    #[tokio::test]
    async fn close_flushes_the_tail() {
        let (mut stage, numbers, _gap_tx, ctl) = outputter(true);
        // 1 and 2 arrive but 0 never does (no gap announced, abnormal).
        for n in [1, 2] {
            ctl.enter_frame();
            stage.process(frame(n)).await.unwrap();
        }
        assert!(numbers.lock().unwrap().is_empty());
        stage.close().await;
        assert_eq!(*numbers.lock().unwrap(), vec![1, 2]);
    }
}
