//! The reader: pulls frames from the source, numbers them and feeds Q0.

use std::sync::Arc;

use argus_media::{Frame, FrameSource};

use crate::control::{Control, StopLevel};
use crate::queue::FrameQueue;

/// Drive a frame source to exhaustion (or interruption).
///
/// Frame numbers are assigned here, strictly monotonically with no gaps;
/// everything downstream relies on them for ordered output. For infinite
/// sources the output queue is cleared before every push, so a pipeline
/// that cannot keep up drops the oldest pending frames.
pub fn spawn_reader(
    mut source: Box<dyn FrameSource>,
    output: Arc<FrameQueue<Frame>>,
    ctl: Control,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let infinite = source.is_infinite();
        let mut frame_number: u64 = 0;

        loop {
            if ctl.level() != StopLevel::Run {
                break;
            }

            let next = tokio::select! {
                biased;
                () = ctl.wait_hard() => break,
                next = source.next_frame() => next,
            };

            match next {
                Ok(Some(source_frame)) => {
                    let frame = source_frame.into_frame(frame_number);
                    frame_number += 1;

                    if infinite {
                        let dropped = output.clear();
                        for _ in 0..dropped {
                            ctl.leave_frame();
                        }
                        if dropped > 0 {
                            tracing::trace!(dropped, "pipeline behind, dropped stale frames");
                        }
                    }

                    ctl.enter_frame();
                    tokio::select! {
                        biased;
                        () = ctl.wait_hard() => {
                            ctl.leave_frame();
                            break;
                        }
                        () = output.put(frame) => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("input failed: {e}");
                    ctl.fail();
                    break;
                }
            }
        }

        source.shutdown().await;
        tracing::debug!(frames = frame_number, "reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_media::{MediaError, SourceFrame};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CountingSource {
        remaining: u64,
        infinite: bool,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(SourceFrame {
                name: format!("frame_{}", self.remaining),
                filename: "mem".into(),
                image: image::RgbImage::new(2, 2),
                video_frame_index: None,
            }))
        }

        fn frame_count(&self) -> Option<u64> {
            (!self.infinite).then_some(self.remaining)
        }

        fn fps(&self) -> f64 {
            25.0
        }

        fn is_infinite(&self) -> bool {
            self.infinite
        }
    }

    #[tokio::test]
    async fn frame_numbers_are_gapless_and_monotonic() {
        let ctl = Control::new();
        let queue = Arc::new(FrameQueue::new(crate::QueueKind::Fifo, 16));
        let handle = spawn_reader(
            Box::new(CountingSource {
                remaining: 5,
                infinite: false,
            }),
            queue.clone(),
            ctl.clone(),
        );
        handle.await.unwrap();

        let mut numbers = Vec::new();
        while let Some(frame) = queue.get(Duration::from_millis(10)).await {
            numbers.push(frame.frame_number);
        }
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert_eq!(ctl.in_flight(), 5);
    }

    #[tokio::test]
    async fn infinite_sources_drop_stale_frames_instead_of_blocking() {
        let ctl = Control::new();
        // Queue far smaller than the frame count: a finite reader would
        // block, an infinite one must clear and keep going.
        let queue = Arc::new(FrameQueue::new(crate::QueueKind::Lifo, 2));
        let handle = spawn_reader(
            Box::new(CountingSource {
                remaining: 50,
                infinite: true,
            }),
            queue.clone(),
            ctl.clone(),
        );
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader must not block")
            .unwrap();

        assert!(queue.len() <= 2);
        // In-flight accounting matches what is still queued.
        assert_eq!(ctl.in_flight(), queue.len());
    }
}
