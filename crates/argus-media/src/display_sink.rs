//! Interactive window sink.
//!
//! minifb windows are not Send, so the window lives on a dedicated OS thread
//! and frames are handed over through a small bounded channel. Pressing `q`
//! or closing the window asks the pipeline to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use minifb::{Key, Window, WindowOptions};

use crate::error::MediaError;
use crate::frame::Frame;
use crate::sink::{FrameSink, SinkAction};

const WINDOW_TITLE: &str = "argus";

#[derive(Debug)]
pub struct DisplaySink {
    sender: Option<SyncSender<RgbImage>>,
    cancelled: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    warned_empty: bool,
}

impl DisplaySink {
    pub fn new(fullscreen: bool) -> Result<Self, MediaError> {
        let (sender, receiver) = sync_channel::<RgbImage>(2);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let thread = std::thread::Builder::new()
            .name("argus-display".into())
            .spawn(move || window_loop(receiver, flag, fullscreen))
            .map_err(|e| MediaError::Display(e.to_string()))?;
        Ok(Self {
            sender: Some(sender),
            cancelled,
            thread: Some(thread),
            warned_empty: false,
        })
    }
}

fn window_loop(receiver: Receiver<RgbImage>, cancelled: Arc<AtomicBool>, fullscreen: bool) {
    let options = WindowOptions {
        borderless: fullscreen,
        ..WindowOptions::default()
    };
    let mut window: Option<Window> = None;

    loop {
        match receiver.recv_timeout(Duration::from_millis(50)) {
            Ok(image) => {
                let (width, height) = (image.width() as usize, image.height() as usize);
                let needs_new = window
                    .as_ref()
                    .map(|w| w.get_size() != (width, height))
                    .unwrap_or(true);
                if needs_new {
                    match Window::new(WINDOW_TITLE, width, height, options.clone()) {
                        Ok(w) => window = Some(w),
                        Err(e) => {
                            tracing::error!("cannot open display window: {e}");
                            cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                let buffer: Vec<u32> = image
                    .pixels()
                    .map(|p| {
                        (u32::from(p.0[0]) << 16) | (u32::from(p.0[1]) << 8) | u32::from(p.0[2])
                    })
                    .collect();
                if let Some(w) = window.as_mut() {
                    if w.update_with_buffer(&buffer, width, height).is_err() {
                        cancelled.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // Keep pumping window events while idle.
                if let Some(w) = window.as_mut() {
                    w.update();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }

        if let Some(w) = &window {
            if !w.is_open() || w.is_key_down(Key::Q) {
                cancelled.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[async_trait]
impl FrameSink for DisplaySink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(SinkAction::Stop);
        }
        let Some(image) = &frame.output_image else {
            if !self.warned_empty {
                tracing::warn!("no image to display");
                self.warned_empty = true;
            }
            return Ok(SinkAction::Continue);
        };
        if let Some(sender) = &self.sender {
            match sender.try_send(image.clone()) {
                Ok(()) => {}
                // The window thread is behind; dropping a display frame is
                // preferable to stalling the pipeline.
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => return Ok(SinkAction::Stop),
            }
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "window".into()
    }
}
