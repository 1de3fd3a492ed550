//! Video-backed frame sources: files, network streams and capture devices.

use std::path::Path;

use async_trait::async_trait;

use crate::error::MediaError;
use crate::ffmpeg::{probe_video, DecodeInput, RawFrameReader, VideoProbe};
use crate::frame::SourceFrame;
use crate::reader::{FrameSource, SourceOptions};

#[derive(Debug, Clone)]
enum VideoKind {
    File { stem: String },
    Stream,
    Device(u32),
}

/// Frames decoded from a video container, a live stream or a device.
///
/// The extraction rate is `min(requested, native)`; ffmpeg performs the rate
/// downsampling, and an additional `skip_frame` stride is applied here on the
/// extracted sequence.
#[derive(Debug)]
pub struct VideoSource {
    kind: VideoKind,
    filename: String,
    reco: String,
    reader: RawFrameReader,
    native_fps: f64,
    extract_fps: f64,
    skip: u32,
    total: Option<u64>,
    infinite: bool,
    /// Count of frames received from the decoder (post rate filter).
    decoded: u64,
}

impl VideoSource {
    pub async fn open_file(path: &Path, opts: &SourceOptions) -> Result<Self, MediaError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let input = DecodeInput::File(path.to_string_lossy().to_string());
        Self::open(input, VideoKind::File { stem }, false, opts).await
    }

    pub async fn open_stream(url: &str, opts: &SourceOptions) -> Result<Self, MediaError> {
        let input = DecodeInput::Url(url.to_string());
        Self::open(input, VideoKind::Stream, true, opts).await
    }

    pub async fn open_device(index: u32, opts: &SourceOptions) -> Result<Self, MediaError> {
        let input = DecodeInput::Device(index);
        Self::open(input, VideoKind::Device(index), true, opts).await
    }

    async fn open(
        input: DecodeInput,
        kind: VideoKind,
        infinite: bool,
        opts: &SourceOptions,
    ) -> Result<Self, MediaError> {
        let probe: VideoProbe = probe_video(&input).await?;

        let native_fps = probe.fps;
        let extract_fps = match opts.input_fps {
            Some(requested) => f64::from(requested).min(native_fps),
            None => native_fps,
        };
        tracing::info!(
            input = %input.display(),
            native_fps,
            extract_fps,
            "opened video source"
        );

        let total = if infinite {
            None
        } else {
            probe.frame_count.map(|native_count| {
                let extracted = (native_count as f64 * extract_fps / native_fps)
                    / f64::from(opts.skip_frame + 1);
                (extracted.floor() as u64).max(1)
            })
        };

        // Only ask ffmpeg to drop frames when the rate actually changes.
        let filter_fps = (extract_fps < native_fps).then_some(extract_fps);
        let reader = RawFrameReader::spawn(&input, probe.width, probe.height, filter_fps)?;

        Ok(Self {
            kind,
            filename: input.display(),
            reco: opts.reco_tag.clone(),
            reader,
            native_fps,
            extract_fps,
            skip: opts.skip_frame,
            total,
            infinite,
            decoded: 0,
        })
    }

    /// Approximate index in the native frame sequence for an extracted frame.
    fn native_index(&self, extracted: u64) -> u64 {
        (extracted as f64 * self.native_fps / self.extract_fps).round() as u64
    }

    fn frame_name(&self, index: u64) -> String {
        match &self.kind {
            VideoKind::File { stem } => format!("{stem}_{index:05}_{}", self.reco),
            VideoKind::Stream => format!("stream_{index:05}_{}", self.reco),
            VideoKind::Device(n) => format!("device{n}_{index:05}_{}", self.reco),
        }
    }
}

#[async_trait]
impl FrameSource for VideoSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
        loop {
            let Some(image) = self.reader.next().await else {
                return Ok(None);
            };
            let extracted = self.decoded;
            self.decoded += 1;
            if extracted % u64::from(self.skip + 1) != 0 {
                continue;
            }
            let index = self.native_index(extracted);
            return Ok(Some(SourceFrame {
                name: self.frame_name(index),
                filename: self.filename.clone(),
                image,
                video_frame_index: Some(index),
            }));
        }
    }

    fn frame_count(&self) -> Option<u64> {
        self.total
    }

    fn fps(&self) -> f64 {
        self.extract_fps
    }

    fn is_infinite(&self) -> bool {
        self.infinite
    }

    async fn shutdown(&mut self) {
        self.reader.shutdown().await;
    }
}
