//! End-to-end pipeline tests over synthetic sources, a scriptable backend
//! and a recording sink.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use argus_backend::{Backend, BackendError, InferError, PendingReply, PendingResult};
use argus_formats::native::PredictionRecord;
use argus_media::{Frame, FrameSink, FrameSource, MediaError, SinkAction, SourceFrame};
use argus_pipeline::{
    run_with_control, Control, PipelineConfig, PostProcessor, RunOutcome,
};

struct SyntheticSource {
    total: u64,
    emitted: u64,
    infinite: bool,
    delay: Option<Duration>,
}

impl SyntheticSource {
    fn finite(total: u64) -> Self {
        Self {
            total,
            emitted: 0,
            infinite: false,
            delay: None,
        }
    }

    fn infinite(total: u64) -> Self {
        Self {
            total,
            emitted: 0,
            infinite: true,
            delay: None,
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.emitted;
        self.emitted += 1;
        Ok(Some(SourceFrame {
            name: format!("f{n}_"),
            filename: "mem".into(),
            image: image::RgbImage::from_pixel(8, 8, image::Rgb([64, 0, 0])),
            video_frame_index: None,
        }))
    }

    fn frame_count(&self) -> Option<u64> {
        (!self.infinite).then_some(self.total)
    }

    fn fps(&self) -> f64 {
        25.0
    }

    fn is_infinite(&self) -> bool {
        self.infinite
    }
}

/// Per-frame backend behavior, keyed by the frame number parsed back out of
/// the synthetic frame name.
#[derive(Default, Debug)]
struct ScriptedBackend {
    fail_wait: HashSet<u64>,
    time_out: HashSet<u64>,
    fail_submit: HashSet<u64>,
    /// Every pending result hangs until cancelled.
    stuck: bool,
    /// Spread of artificial latencies so sender completions race.
    jitter: bool,
}

fn frame_index(name: &str) -> u64 {
    name.trim_start_matches('f')
        .trim_end_matches('_')
        .parse()
        .unwrap_or(0)
}

struct ScriptedPending {
    outcome: Result<PredictionRecord, InferError>,
    delay: Duration,
    stuck: bool,
}

#[async_trait]
impl PendingReply for ScriptedPending {
    async fn wait(self: Box<Self>, timeout: Duration) -> Result<PredictionRecord, InferError> {
        if self.stuck {
            std::future::pending::<()>().await;
        }
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        match self.outcome {
            Err(InferError::Timeout(_)) => Err(InferError::Timeout(timeout)),
            other => other,
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn infer(&self, _image: Bytes, frame_name: &str) -> Result<PendingResult, BackendError> {
        let n = frame_index(frame_name);
        if self.fail_submit.contains(&n) {
            return Err(BackendError::Transport(format!(
                "connection reset while submitting frame {n}"
            )));
        }
        let outcome = if self.time_out.contains(&n) {
            Err(InferError::Timeout(Duration::ZERO))
        } else if self.fail_wait.contains(&n) {
            Err(InferError::Failed {
                code: "worker_error".into(),
                message: format!("scripted failure for frame {n}"),
            })
        } else {
            Ok(PredictionRecord::empty())
        };
        let delay = if self.jitter {
            Duration::from_millis((n * 7) % 23)
        } else {
            Duration::from_millis(15)
        };
        Ok(PendingResult::new(ScriptedPending {
            outcome,
            delay,
            stuck: self.stuck,
        }))
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Recording {
    numbers: Arc<Mutex<Vec<u64>>>,
    with_image: Arc<Mutex<usize>>,
}

struct RecordingSink {
    recording: Recording,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        self.recording
            .numbers
            .lock()
            .unwrap()
            .push(frame.frame_number);
        if frame.output_image.is_some() {
            *self.recording.with_image.lock().unwrap() += 1;
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".into()
    }
}

fn small_config() -> PipelineConfig {
    PipelineConfig {
        queue_size: 8,
        result_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

fn is_strictly_increasing(numbers: &[u64]) -> bool {
    numbers.windows(2).all(|w| w[0] < w[1])
}

#[tokio::test]
async fn finite_run_emits_every_frame_in_order() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend {
        jitter: true,
        ..Default::default()
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_with_control(
            Box::new(SyntheticSource::finite(25)),
            vec![Box::new(RecordingSink {
                recording: recording.clone(),
            })],
            Some(backend),
            PostProcessor::None,
            small_config(),
            ctl.clone(),
        ),
    )
    .await
    .expect("run should finish");

    assert_eq!(outcome, RunOutcome::Completed);
    let numbers = recording.numbers.lock().unwrap().clone();
    assert_eq!(numbers, (0..25).collect::<Vec<u64>>());
    assert_eq!(ctl.in_flight(), 0);
}

#[tokio::test]
async fn dropped_frames_leave_gaps_without_breaking_order() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend {
        fail_wait: HashSet::from([3, 11]),
        time_out: HashSet::from([6]),
        jitter: true,
        ..Default::default()
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_with_control(
            Box::new(SyntheticSource::finite(15)),
            vec![Box::new(RecordingSink {
                recording: recording.clone(),
            })],
            Some(backend),
            PostProcessor::None,
            small_config(),
            ctl.clone(),
        ),
    )
    .await
    .expect("run should finish");

    assert_eq!(outcome, RunOutcome::Completed);
    let numbers = recording.numbers.lock().unwrap().clone();
    let expected: Vec<u64> = (0..15).filter(|n| ![3, 6, 11].contains(n)).collect();
    assert_eq!(numbers, expected);
    assert_eq!(ctl.in_flight(), 0);
}

#[tokio::test]
async fn noop_mode_passes_frames_straight_through() {
    let recording = Recording::default();
    let ctl = Control::new();

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_with_control(
            Box::new(SyntheticSource::finite(10)),
            vec![Box::new(RecordingSink {
                recording: recording.clone(),
            })],
            None,
            PostProcessor::Passthrough,
            small_config(),
            ctl,
        ),
    )
    .await
    .expect("run should finish");

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(
        recording.numbers.lock().unwrap().clone(),
        (0..10).collect::<Vec<u64>>()
    );
    // Passthrough sets pixels on every emitted frame.
    assert_eq!(*recording.with_image.lock().unwrap(), 10);
}

#[tokio::test]
async fn submission_failure_aborts_the_run() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend {
        fail_submit: HashSet::from([4]),
        ..Default::default()
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_with_control(
            Box::new(SyntheticSource::finite(50)),
            vec![Box::new(RecordingSink {
                recording: recording.clone(),
            })],
            Some(backend),
            PostProcessor::None,
            small_config(),
            ctl,
        ),
    )
    .await
    .expect("run should finish");

    assert_eq!(outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn infinite_inputs_drop_frames_but_keep_increasing_order() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend::default());

    let config = PipelineConfig {
        queue_size: 4,
        result_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_with_control(
            Box::new(SyntheticSource::infinite(150)),
            vec![Box::new(RecordingSink {
                recording: recording.clone(),
            })],
            Some(backend),
            PostProcessor::None,
            config,
            ctl,
        ),
    )
    .await
    .expect("run should finish");

    assert_eq!(outcome, RunOutcome::Completed);
    let numbers = recording.numbers.lock().unwrap().clone();
    assert!(!numbers.is_empty());
    // A 150-frame burst through tiny queues with a 15 ms backend cannot
    // survive intact; the drop policy must have discarded some frames.
    assert!(numbers.len() < 150, "expected drops, got {}", numbers.len());
    assert!(is_strictly_increasing(&numbers));
}

#[tokio::test]
async fn graceful_interrupt_drains_and_completes() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend::default());

    let mut source = SyntheticSource::finite(10_000);
    source.delay = Some(Duration::from_millis(2));

    let run = tokio::spawn(run_with_control(
        Box::new(source),
        vec![Box::new(RecordingSink {
            recording: recording.clone(),
        })],
        Some(backend),
        PostProcessor::None,
        small_config(),
        ctl.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    ctl.request_drain();

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("drain must be fast once requested")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let numbers = recording.numbers.lock().unwrap().clone();
    assert!(!numbers.is_empty());
    assert!(numbers.len() < 10_000);
    assert!(is_strictly_increasing(&numbers));
    assert_eq!(ctl.in_flight(), 0);
}

#[tokio::test]
async fn second_interrupt_stops_in_bounded_time_with_a_stuck_backend() {
    let recording = Recording::default();
    let ctl = Control::new();
    let backend = Arc::new(ScriptedBackend {
        stuck: true,
        ..Default::default()
    });

    // A deadline far beyond the test budget: only the hard stop can end
    // the wait.
    let config = PipelineConfig {
        queue_size: 4,
        result_timeout: Duration::from_secs(3600),
        ..PipelineConfig::default()
    };

    let run = tokio::spawn(run_with_control(
        Box::new(SyntheticSource::finite(100)),
        vec![Box::new(RecordingSink {
            recording: recording.clone(),
        })],
        Some(backend),
        PostProcessor::None,
        config,
        ctl.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    ctl.request_drain();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctl.request_hard();

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("hard stop must be bounded")
        .unwrap();

    assert_eq!(outcome, RunOutcome::HardInterrupted);
}
