//! Pipeline assembly, lifecycle and shutdown.
//!
//! The supervisor builds the queue/pool chain for the selected mode, runs
//! the reader to exhaustion, then drains and joins the pools in pipeline
//! order. Interrupt handling is two-level: the first interrupt stops the
//! reader and lets everything drain (exit 0), a second one forces every
//! worker to abandon its current message (exit 2). Any worker error forces
//! the same hard stop with exit 1.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use argus_backend::Backend;
use argus_media::{Frame, FrameSink, FrameSource};

use crate::control::{Control, StopLevel};
use crate::output::{OutputterStage, PostProcessor};
use crate::progress::Progress;
use crate::queue::{Clearable, FrameQueue, QueueKind};
use crate::reader::spawn_reader;
use crate::stages::{EncoderStage, InFlight, ReceiverStage, SenderStage};
use crate::worker::Pool;

pub const DEFAULT_QUEUE_SIZE: usize = 50;
pub const DEFAULT_SENDER_COUNT: usize = 5;
/// Per-frame deadline for awaiting a backend result.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_size: usize,
    pub sender_count: usize,
    pub result_timeout: Duration,
    /// User threshold overriding the per-label ones.
    pub threshold: Option<f64>,
    /// Emit studio-shaped predictions.
    pub studio_format: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            sender_count: DEFAULT_SENDER_COUNT,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
            threshold: None,
            studio_format: false,
        }
    }
}

/// How the run ended; maps one-to-one onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran to completion, or drained gracefully after one interrupt.
    Completed,
    /// Unrecoverable error in a worker or the input.
    Failed,
    /// Second interrupt forced a hard stop mid-drain.
    HardInterrupted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed => 1,
            RunOutcome::HardInterrupted => 2,
        }
    }
}

/// Run the pipeline with interrupt signals wired to the process signal
/// handlers.
pub async fn run(
    source: Box<dyn FrameSource>,
    sinks: Vec<Box<dyn FrameSink>>,
    backend: Option<Arc<dyn Backend>>,
    post: PostProcessor,
    config: PipelineConfig,
) -> RunOutcome {
    let ctl = Control::new();
    let signal_task = tokio::spawn(handle_signals(ctl.clone()));
    let outcome = run_with_control(source, sinks, backend, post, config, ctl).await;
    signal_task.abort();
    outcome
}

/// Run the pipeline under an externally owned [`Control`]. Embedders (and
/// tests) drive interruption through the control instead of signals.
pub async fn run_with_control(
    source: Box<dyn FrameSource>,
    sinks: Vec<Box<dyn FrameSink>>,
    backend: Option<Arc<dyn Backend>>,
    post: PostProcessor,
    config: PipelineConfig,
    ctl: Control,
) -> RunOutcome {
    let infinite = source.is_infinite();
    let kind = if infinite {
        QueueKind::Lifo
    } else {
        QueueKind::Fifo
    };
    let progress = Progress::new(if infinite { None } else { source.frame_count() });
    let (gap_tx, gap_rx) = mpsc::unbounded_channel();

    let q_read: Arc<FrameQueue<Frame>> = Arc::new(FrameQueue::new(kind, config.queue_size));
    let mut clearables: Vec<Arc<dyn Clearable>> = vec![q_read.clone()];
    let mut pools: Vec<Pool> = Vec::new();

    let outputter_ordered = !infinite;

    match &backend {
        Some(backend) => {
            let q_encoded: Arc<FrameQueue<Frame>> =
                Arc::new(FrameQueue::new(kind, config.queue_size));
            let q_sent: Arc<FrameQueue<InFlight>> =
                Arc::new(FrameQueue::new(kind, config.queue_size));
            let q_received: Arc<FrameQueue<Frame>> =
                Arc::new(FrameQueue::new(kind, config.queue_size));
            clearables.push(q_encoded.clone());
            clearables.push(q_sent.clone());
            clearables.push(q_received.clone());

            pools.push(Pool::spawn(
                "encode",
                vec![EncoderStage::new(gap_tx.clone(), ctl.clone())],
                q_read.clone(),
                Some(q_encoded.clone()),
                ctl.clone(),
            ));

            let senders: Vec<SenderStage> = (0..config.sender_count.max(1))
                .map(|_| SenderStage::new(backend.clone()))
                .collect();
            pools.push(Pool::spawn(
                "send",
                senders,
                q_encoded,
                Some(q_sent.clone()),
                ctl.clone(),
            ));

            pools.push(Pool::spawn(
                "receive",
                vec![ReceiverStage::new(
                    config.result_timeout,
                    config.threshold,
                    config.studio_format,
                    gap_tx.clone(),
                    ctl.clone(),
                )],
                q_sent,
                Some(q_received.clone()),
                ctl.clone(),
            ));

            pools.push(Pool::spawn(
                "output",
                vec![OutputterStage::new(
                    sinks,
                    post,
                    outputter_ordered,
                    gap_rx,
                    progress.clone(),
                    ctl.clone(),
                )],
                q_received,
                None,
                ctl.clone(),
            ));
        }
        None => {
            // Noop mode: no sender or receiver, the encoder feeds the
            // output stage directly.
            let q_encoded: Arc<FrameQueue<Frame>> =
                Arc::new(FrameQueue::new(kind, config.queue_size));
            clearables.push(q_encoded.clone());

            pools.push(Pool::spawn(
                "encode",
                vec![EncoderStage::new(gap_tx.clone(), ctl.clone())],
                q_read.clone(),
                Some(q_encoded.clone()),
                ctl.clone(),
            ));
            pools.push(Pool::spawn(
                "output",
                vec![OutputterStage::new(
                    sinks,
                    post,
                    outputter_ordered,
                    gap_rx,
                    progress.clone(),
                    ctl.clone(),
                )],
                q_encoded,
                None,
                ctl.clone(),
            ));
        }
    }

    // On a hard stop every queue is cleared so no worker stays blocked on a
    // full queue.
    let clear_task = {
        let mut rx = ctl.subscribe();
        let clearables = clearables.clone();
        tokio::spawn(async move {
            loop {
                if *rx.borrow() == StopLevel::Hard {
                    for queue in &clearables {
                        queue.clear_all();
                    }
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    };

    let reader = spawn_reader(source, q_read, ctl.clone());
    if let Err(e) = reader.await {
        tracing::warn!("reader task panicked: {e}");
        ctl.fail();
    }

    // Drain and join in pipeline order: each pool is only asked to stop
    // once its upstream has fully stopped, so "input queue empty" means
    // "no more work will ever arrive".
    for pool in &mut pools {
        pool.request_drain();
        pool.join().await;
    }

    clear_task.abort();

    if let Some(backend) = backend {
        if let Err(e) = backend.close().await {
            tracing::warn!("backend close failed: {e}");
        }
    }
    progress.finish();

    if ctl.is_failed() {
        RunOutcome::Failed
    } else if ctl.level() == StopLevel::Hard {
        RunOutcome::HardInterrupted
    } else {
        RunOutcome::Completed
    }
}

/// Two-level interrupt handling: drain first, hard stop on insistence.
async fn handle_signals(ctl: Control) {
    let mut interrupts = 0u32;
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    loop {
        #[cfg(unix)]
        {
            let term = async {
                match terminate.as_mut() {
                    Some(stream) => {
                        stream.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                () = term => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        interrupts += 1;
        if interrupts == 1 {
            tracing::info!("interrupt received, draining pipeline (interrupt again to force stop)");
            ctl.request_drain();
        } else {
            tracing::warn!("second interrupt, stopping now");
            ctl.request_hard();
            return;
        }
    }
}
