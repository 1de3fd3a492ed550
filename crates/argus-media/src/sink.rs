//! Frame sinks and output descriptor dispatch.
//!
//! A run may carry several sinks; the output stage hands every emitted frame
//! to each of them. Descriptors map to sinks the same way inputs map to
//! sources: an existing directory wins over extension matching, `stdout` and
//! `window` are reserved words, everything else dispatches on the extension.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use argus_formats::convert::record_to_studio;
use argus_formats::native::NativeEntry;
use argus_formats::studio::StudioDataset;
use argus_formats::PredictionPayload;

use crate::error::MediaError;
use crate::frame::Frame;
use crate::reader::{has_extension, IMAGE_EXTENSIONS};
use crate::video_sink::VideoSink;

/// Byte order of raw pixel output on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Rgb,
    Bgr,
    Gray,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Also write prediction JSON beside image/video outputs.
    pub json: bool,
    /// Frame rate for video writers.
    pub output_fps: Option<u32>,
    /// Fullscreen window sink.
    pub fullscreen: bool,
    /// Raw stdout byte order.
    pub color_space: ColorSpace,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            json: false,
            output_fps: None,
            fullscreen: false,
            color_space: ColorSpace::Rgb,
        }
    }
}

/// What the output stage should do after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkAction {
    Continue,
    /// The sink asked to end the run (window closed or `q` pressed).
    Stop,
}

#[async_trait]
pub trait FrameSink: Send + std::fmt::Debug {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError>;

    /// Flush and release resources. Called exactly once at shutdown.
    async fn close(&mut self) -> Result<(), MediaError>;

    /// Short name used in write-failure log lines.
    fn describe(&self) -> String;
}

/// Open the sink matching an output descriptor.
pub fn open_sink(descriptor: &str, opts: &SinkOptions) -> Result<Box<dyn FrameSink>, MediaError> {
    let path = Path::new(descriptor);
    if path.is_dir() {
        return Ok(Box::new(DirectorySink::new(path, opts)));
    }
    if has_extension(path, IMAGE_EXTENSIONS) {
        return Ok(Box::new(ImageSink::new(descriptor, opts)));
    }
    if VideoSink::matches(path) {
        return Ok(Box::new(VideoSink::new(descriptor, opts)?));
    }
    if has_extension(path, &["json"]) {
        return Ok(Box::new(JsonSink::new(descriptor)));
    }
    if descriptor == "stdout" {
        return Ok(Box::new(StdoutSink::new(opts.color_space)));
    }
    if descriptor == "window" {
        #[cfg(feature = "display")]
        return Ok(Box::new(crate::display_sink::DisplaySink::new(
            opts.fullscreen,
        )?));
        #[cfg(not(feature = "display"))]
        return Err(MediaError::Display(
            "this build has no window support (enable the `display` feature)".into(),
        ));
    }
    Err(MediaError::UnknownOutput(descriptor.to_string()))
}

/// Substitute a printf-style `%d` / `%0Nd` counter in a descriptor.
/// Returns `None` when the descriptor carries no counter.
pub(crate) fn expand_counter(descriptor: &str, index: u64) -> Option<String> {
    let start = descriptor.find('%')?;
    let rest = &descriptor[start + 1..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let after = &rest[digits.len()..];
    if !after.starts_with('d') {
        return None;
    }
    let formatted = if let Some(width) = digits.strip_prefix('0') {
        let width: usize = width.parse().unwrap_or(0);
        format!("{index:0width$}")
    } else if !digits.is_empty() {
        let width: usize = digits.parse().unwrap_or(0);
        format!("{index:width$}")
    } else {
        index.to_string()
    };
    let mut out = String::with_capacity(descriptor.len() + formatted.len());
    out.push_str(&descriptor[..start]);
    out.push_str(&formatted);
    out.push_str(&after[1..]);
    Some(out)
}

/// The studio-shaped view of a frame's predictions, for aggregation.
pub(crate) fn studio_view(frame: &Frame) -> Option<StudioDataset> {
    match frame.predictions.as_ref()? {
        PredictionPayload::Studio(dataset) => Some(dataset.clone()),
        PredictionPayload::Native(record) => Some(record_to_studio(&frame.name, record)),
    }
}

/// Predictions as written to JSON files. Native records become a one-entry
/// native document (an array carrying the frame's location), so recorded
/// output can be replayed as a prediction file later.
pub(crate) fn payload_json(frame: &Frame) -> Option<serde_json::Value> {
    match frame.predictions.as_ref()? {
        PredictionPayload::Studio(dataset) => serde_json::to_value(dataset).ok(),
        PredictionPayload::Native(record) => serde_json::to_value([NativeEntry {
            location: Some(frame.name.clone()),
            outputs: record.outputs.clone(),
        }])
        .ok(),
    }
}

pub(crate) fn write_json_file(path: &Path, value: &impl Serialize) -> Result<(), MediaError> {
    let text = serde_json::to_string(value).map_err(|e| MediaError::Write {
        target: path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })?;
    tracing::info!(path = %path.display(), "writing predictions");
    std::fs::write(path, text).map_err(|e| MediaError::Write {
        target: path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })
}

/// One image file per frame; a counter in the path keeps them apart,
/// otherwise the file is overwritten.
#[derive(Debug)]
pub struct ImageSink {
    descriptor: String,
    json: bool,
    index: u64,
}

impl ImageSink {
    pub fn new(descriptor: &str, opts: &SinkOptions) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            json: opts.json,
            index: 0,
        }
    }
}

#[async_trait]
impl FrameSink for ImageSink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        let path = expand_counter(&self.descriptor, self.index)
            .unwrap_or_else(|| self.descriptor.clone());
        self.index += 1;

        if let Some(image) = &frame.output_image {
            tracing::info!(%path, "writing frame");
            image.save(&path).map_err(|e| MediaError::Write {
                target: path.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.json {
            if let Some(predictions) = payload_json(frame) {
                write_json_file(&Path::new(&path).with_extension("json"), &predictions)?;
            }
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("image:{}", self.descriptor)
    }
}

/// `<name>.jpg` (and optionally `<name>.json`) inside an existing directory.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    json: bool,
}

impl DirectorySink {
    pub fn new(dir: &Path, opts: &SinkOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            json: opts.json,
        }
    }
}

#[async_trait]
impl FrameSink for DirectorySink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        let base = self.dir.join(&frame.name);
        if let Some(image) = &frame.output_image {
            let path = base.with_extension("jpg");
            tracing::info!(path = %path.display(), "writing frame");
            image.save(&path).map_err(|e| MediaError::Write {
                target: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;
        }
        if self.json {
            if let Some(predictions) = payload_json(frame) {
                write_json_file(&base.with_extension("json"), &predictions)?;
            }
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.dir.display())
    }
}

/// Prediction JSON output. With a counter, one file per frame; without one,
/// a single studio-shaped document aggregated over the whole run and written
/// on close.
#[derive(Debug)]
pub struct JsonSink {
    descriptor: String,
    index: u64,
    aggregate: Option<StudioDataset>,
}

impl JsonSink {
    pub fn new(descriptor: &str) -> Self {
        let aggregate = if expand_counter(descriptor, 0).is_some() {
            None
        } else {
            Some(StudioDataset::default())
        };
        Self {
            descriptor: descriptor.to_string(),
            index: 0,
            aggregate,
        }
    }
}

#[async_trait]
impl FrameSink for JsonSink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        self.index += 1;
        match &mut self.aggregate {
            Some(aggregate) => {
                if let Some(dataset) = studio_view(frame) {
                    aggregate.merge(dataset);
                }
            }
            None => {
                // The first per-frame file is numbered 1, matching the count
                // of frames written so far.
                let path = expand_counter(&self.descriptor, self.index)
                    .unwrap_or_else(|| self.descriptor.clone());
                if let Some(predictions) = payload_json(frame) {
                    write_json_file(Path::new(&path), &predictions)?;
                }
            }
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        if let Some(aggregate) = self.aggregate.take() {
            write_json_file(Path::new(&self.descriptor), &aggregate)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.descriptor)
    }
}

/// Raw pixel bytes on stdout, for piping into an external encoder. Frames
/// without an output image fall back to one prediction JSON line.
#[derive(Debug)]
pub struct StdoutSink {
    color_space: ColorSpace,
}

impl StdoutSink {
    pub fn new(color_space: ColorSpace) -> Self {
        Self { color_space }
    }
}

#[async_trait]
impl FrameSink for StdoutSink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        let mut out = std::io::stdout().lock();
        match &frame.output_image {
            Some(image) => {
                let bytes = match self.color_space {
                    ColorSpace::Rgb => image.as_raw().clone(),
                    ColorSpace::Bgr => {
                        let mut data = image.as_raw().clone();
                        for px in data.chunks_exact_mut(3) {
                            px.swap(0, 2);
                        }
                        data
                    }
                    ColorSpace::Gray => image::imageops::grayscale(image).into_raw(),
                };
                out.write_all(&bytes)
                    .map_err(|e| MediaError::io("stdout write", e))?;
            }
            None => {
                if let Some(predictions) = payload_json(frame) {
                    let line =
                        serde_json::to_string(&predictions).map_err(|e| MediaError::Write {
                            target: "stdout".into(),
                            reason: e.to_string(),
                        })?;
                    writeln!(out, "{line}").map_err(|e| MediaError::io("stdout write", e))?;
                }
            }
        }
        out.flush().map_err(|e| MediaError::io("stdout flush", e))?;
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "stdout".into()
    }
}
