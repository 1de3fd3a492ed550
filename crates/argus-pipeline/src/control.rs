//! Shared run state: the stop level, the failure flag and the in-flight
//! frame counter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Escalating stop levels. `Drain` stops the reader and lets downstream
/// pools empty their queues; `Hard` makes every worker abandon its current
/// message and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopLevel {
    Run,
    Drain,
    Hard,
}

#[derive(Clone)]
pub struct Control {
    stop_tx: Arc<watch::Sender<StopLevel>>,
    stop_rx: watch::Receiver<StopLevel>,
    failed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl Control {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(StopLevel::Run);
        Self {
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            failed: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn level(&self) -> StopLevel {
        *self.stop_rx.borrow()
    }

    /// Raise the stop level; levels never go back down.
    fn escalate(&self, new: StopLevel) {
        self.stop_tx.send_if_modified(|level| {
            if new > *level {
                *level = new;
                true
            } else {
                false
            }
        });
    }

    pub fn request_drain(&self) {
        self.escalate(StopLevel::Drain);
    }

    pub fn request_hard(&self) {
        self.escalate(StopLevel::Hard);
    }

    /// Record a worker failure and force a hard stop.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.request_hard();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<StopLevel> {
        self.stop_rx.clone()
    }

    /// Resolves when the hard-stop level is reached. Never resolves
    /// otherwise, so it is meant for the losing side of a `select!`.
    pub async fn wait_hard(&self) {
        let mut rx = self.stop_rx.clone();
        loop {
            if *rx.borrow() == StopLevel::Hard {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without reaching Hard; park forever.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Frames currently inside the pipeline. The reader increments, the
    /// output stage (or any stage that drops a frame) decrements.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn enter_frame(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave_frame(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight counter underflow");
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn levels_only_escalate() {
        let ctl = Control::new();
        assert_eq!(ctl.level(), StopLevel::Run);
        ctl.request_hard();
        ctl.request_drain();
        assert_eq!(ctl.level(), StopLevel::Hard);
    }

    #[test]
    fn failure_implies_hard_stop() {
        let ctl = Control::new();
        ctl.fail();
        assert!(ctl.is_failed());
        assert_eq!(ctl.level(), StopLevel::Hard);
    }

    #[tokio::test]
    async fn wait_hard_resolves_on_escalation() {
        let ctl = Control::new();
        let waiter = ctl.clone();
        let handle = tokio::spawn(async move { waiter.wait_hard().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctl.request_hard();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_hard should resolve")
            .unwrap();
    }

    #[test]
    fn in_flight_counts_balance() {
        let ctl = Control::new();
        ctl.enter_frame();
        ctl.enter_frame();
        assert_eq!(ctl.in_flight(), 2);
        ctl.leave_frame();
        assert_eq!(ctl.in_flight(), 1);
    }
}
