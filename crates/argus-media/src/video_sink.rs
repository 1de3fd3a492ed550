//! Video file sink: re-encodes frames through an ffmpeg child process.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use argus_formats::studio::StudioDataset;

use crate::error::MediaError;
use crate::frame::Frame;
use crate::sink::{studio_view, write_json_file, FrameSink, SinkAction, SinkOptions};

pub const DEFAULT_OUTPUT_FPS: u32 = 25;

/// The closed table of supported containers. The four-character code is the
/// tag recorded in the container; the encoder column is the ffmpeg codec
/// that produces it.
#[derive(Debug, Clone, Copy)]
pub struct VideoCodec {
    pub extension: &'static str,
    pub fourcc: &'static str,
    pub encoder: &'static str,
    pub extra_args: &'static [&'static str],
}

pub const VIDEO_CODECS: &[VideoCodec] = &[
    VideoCodec {
        extension: "mp4",
        fourcc: "mp4v",
        encoder: "mpeg4",
        extra_args: &[],
    },
    VideoCodec {
        extension: "avi",
        fourcc: "XVID",
        encoder: "mpeg4",
        extra_args: &["-vtag", "XVID"],
    },
    VideoCodec {
        extension: "webm",
        fourcc: "VP90",
        encoder: "libvpx-vp9",
        extra_args: &[],
    },
    VideoCodec {
        extension: "mjpg",
        fourcc: "MJPG",
        encoder: "mjpeg",
        extra_args: &[],
    },
];

pub fn codec_for(path: &Path) -> Option<&'static VideoCodec> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    VIDEO_CODECS.iter().find(|c| c.extension == ext)
}

#[derive(Debug)]
struct Writer {
    child: Child,
    stdin: ChildStdin,
    width: u32,
    height: u32,
}

/// Writes frames to one video file. The encoder child is spawned lazily on
/// the first frame, once the dimensions are known.
pub struct VideoSink {
    descriptor: String,
    codec: &'static VideoCodec,
    fps: u32,
    json: bool,
    writer: Option<Writer>,
    aggregate: StudioDataset,
}

impl VideoSink {
    pub fn matches(path: &Path) -> bool {
        codec_for(path).is_some()
    }

    pub fn new(descriptor: &str, opts: &SinkOptions) -> Result<Self, MediaError> {
        let codec = codec_for(Path::new(descriptor))
            .ok_or_else(|| MediaError::UnknownOutput(descriptor.to_string()))?;
        Ok(Self {
            descriptor: descriptor.to_string(),
            codec,
            fps: opts.output_fps.unwrap_or(DEFAULT_OUTPUT_FPS),
            json: opts.json,
            writer: None,
            aggregate: StudioDataset::default(),
        })
    }

    /// The encode command: raw RGB24 on stdin, container chosen by the
    /// descriptor's extension.
    fn encoder_command(&self, width: u32, height: u32) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-v", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{width}x{height}")])
            .args(["-r", &self.fps.to_string()])
            .args(["-i", "pipe:0"])
            .args(["-c:v", self.codec.encoder]);
        for arg in self.codec.extra_args {
            cmd.arg(arg);
        }
        cmd.args(["-pix_fmt", "yuv420p"]).arg(&self.descriptor);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn open_writer(&mut self, width: u32, height: u32) -> Result<(), MediaError> {
        tracing::info!(path = %self.descriptor, fourcc = self.codec.fourcc, "writing video");
        let mut child = self
            .encoder_command(width, height)
            .spawn()
            .map_err(|e| MediaError::Write {
                target: self.descriptor.clone(),
                reason: format!("could not start ffmpeg: {e}"),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| MediaError::Write {
            target: self.descriptor.clone(),
            reason: "ffmpeg stdin unavailable".into(),
        })?;
        self.writer = Some(Writer {
            child,
            stdin,
            width,
            height,
        });
        Ok(())
    }
}

#[async_trait]
impl FrameSink for VideoSink {
    async fn write(&mut self, frame: &Frame) -> Result<SinkAction, MediaError> {
        let Some(image) = &frame.output_image else {
            tracing::warn!(frame = %frame.name, "no image to write");
            return Ok(SinkAction::Continue);
        };

        if self.writer.is_none() {
            self.open_writer(image.width(), image.height())?;
        }
        let writer = self.writer.as_mut().ok_or_else(|| MediaError::Write {
            target: self.descriptor.clone(),
            reason: "writer unavailable".into(),
        })?;

        if (image.width(), image.height()) != (writer.width, writer.height) {
            tracing::warn!(
                frame = %frame.name,
                "frame size {}x{} differs from writer {}x{}, skipping",
                image.width(),
                image.height(),
                writer.width,
                writer.height
            );
            return Ok(SinkAction::Continue);
        }

        writer
            .stdin
            .write_all(image.as_raw())
            .await
            .map_err(|e| MediaError::Write {
                target: self.descriptor.clone(),
                reason: e.to_string(),
            })?;

        if self.json {
            if let Some(dataset) = studio_view(frame) {
                self.aggregate.merge(dataset);
            }
        }
        Ok(SinkAction::Continue)
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        if let Some(mut writer) = self.writer.take() {
            // Closing stdin lets ffmpeg finalize the container.
            writer
                .stdin
                .shutdown()
                .await
                .map_err(|e| MediaError::io("encoder stdin close", e))?;
            drop(writer.stdin);
            let status = writer.child.wait().await.map_err(|e| {
                MediaError::io("encoder wait", e)
            })?;
            if !status.success() {
                return Err(MediaError::Write {
                    target: self.descriptor.clone(),
                    reason: format!("ffmpeg exited with {status}"),
                });
            }
        }
        if self.json {
            let path = Path::new(&self.descriptor).with_extension("json");
            write_json_file(&path, &self.aggregate)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("video:{}", self.descriptor)
    }
}
