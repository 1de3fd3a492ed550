//! The stage seam and the generic pool.
//!
//! Every stage implements the same loop skeleton — pop, work, push — so
//! stages only supply `process`. A pool runs N identical workers between two
//! queues; all pools are size one except the sender pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::control::{Control, StopLevel};
use crate::queue::FrameQueue;
use crate::PipelineError;

/// How often idle workers re-check their queue and the stop flags.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of processing one message.
pub enum Step<T> {
    Emit(T),
    /// The message was consumed without output (dropped frame).
    Skip,
    /// The stage is finished; the worker exits.
    Done,
}

#[async_trait]
pub trait StageWorker: Send {
    type In: Send + 'static;
    type Out: Send + 'static;

    async fn process(&mut self, msg: Self::In) -> Result<Step<Self::Out>, PipelineError>;

    /// Called once when the worker exits, on every path.
    async fn close(&mut self) {}
}

/// A fixed set of identical workers draining one queue into another.
pub struct Pool {
    name: &'static str,
    drain: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pool {
    pub fn spawn<W>(
        name: &'static str,
        workers: Vec<W>,
        input: Arc<FrameQueue<W::In>>,
        output: Option<Arc<FrameQueue<W::Out>>>,
        ctl: Control,
    ) -> Self
    where
        W: StageWorker + 'static,
    {
        let drain = Arc::new(AtomicBool::new(false));
        let handles = workers
            .into_iter()
            .map(|worker| {
                let input = input.clone();
                let output = output.clone();
                let ctl = ctl.clone();
                let drain = drain.clone();
                tokio::spawn(worker_loop(name, worker, input, output, ctl, drain))
            })
            .collect();
        Self {
            name,
            drain,
            handles,
        }
    }

    /// Ask the workers to exit once their input queue is empty. Only called
    /// after the upstream pool has been joined, so no more items can arrive.
    pub fn request_drain(&self) {
        self.drain.store(true, Ordering::SeqCst);
    }

    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(pool = self.name, "worker task panicked: {e}");
            }
        }
        tracing::debug!(pool = self.name, "pool stopped");
    }
}

async fn worker_loop<W>(
    name: &'static str,
    mut worker: W,
    input: Arc<FrameQueue<W::In>>,
    output: Option<Arc<FrameQueue<W::Out>>>,
    ctl: Control,
    drain: Arc<AtomicBool>,
) where
    W: StageWorker,
{
    loop {
        if ctl.level() == StopLevel::Hard {
            break;
        }
        if drain.load(Ordering::SeqCst) && input.is_empty() {
            break;
        }
        let Some(msg) = input.get(POLL_INTERVAL).await else {
            continue;
        };

        // A hard stop abandons the in-flight message so shutdown stays
        // bounded even when the backend hangs.
        let step = tokio::select! {
            biased;
            () = ctl.wait_hard() => break,
            step = worker.process(msg) => step,
        };

        match step {
            Ok(Step::Emit(out)) => {
                if let Some(queue) = &output {
                    tokio::select! {
                        biased;
                        () = ctl.wait_hard() => break,
                        () = queue.put(out) => {}
                    }
                }
            }
            Ok(Step::Skip) => {}
            Ok(Step::Done) => break,
            Err(e) => {
                tracing::error!(stage = name, "worker failed: {e}");
                ctl.fail();
                break;
            }
        }
    }
    worker.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueKind;

    struct Doubler;

    #[async_trait]
    impl StageWorker for Doubler {
        type In = u64;
        type Out = u64;

        async fn process(&mut self, msg: u64) -> Result<Step<u64>, PipelineError> {
            if msg == 13 {
                return Err(PipelineError::Other("unlucky".into()));
            }
            Ok(Step::Emit(msg * 2))
        }
    }

    #[tokio::test]
    async fn pool_drains_its_queue_then_stops() {
        let ctl = Control::new();
        let input = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let output = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let mut pool = Pool::spawn("double", vec![Doubler], input.clone(), Some(output.clone()), ctl);

        for i in 0..5 {
            input.put(i).await;
        }
        pool.request_drain();
        tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("pool should stop");

        let mut results = Vec::new();
        while let Some(v) = output.get(Duration::from_millis(10)).await {
            results.push(v);
        }
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn worker_error_raises_the_failure_flag() {
        let ctl = Control::new();
        let input = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let output: Arc<FrameQueue<u64>> = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let mut pool = Pool::spawn(
            "double",
            vec![Doubler],
            input.clone(),
            Some(output),
            ctl.clone(),
        );

        input.put(13).await;
        tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("pool should stop");
        assert!(ctl.is_failed());
        assert_eq!(ctl.level(), StopLevel::Hard);
    }

    struct Stuck;

    #[async_trait]
    impl StageWorker for Stuck {
        type In = u64;
        type Out = u64;

        async fn process(&mut self, _msg: u64) -> Result<Step<u64>, PipelineError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn hard_stop_abandons_a_stuck_worker() {
        let ctl = Control::new();
        let input = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let output: Arc<FrameQueue<u64>> = Arc::new(FrameQueue::new(QueueKind::Fifo, 8));
        let mut pool = Pool::spawn("stuck", vec![Stuck], input.clone(), Some(output), ctl.clone());

        input.put(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctl.request_hard();
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("hard stop must be bounded");
    }
}
