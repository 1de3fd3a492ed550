//! ffprobe/ffmpeg subprocess plumbing.
//!
//! Video decode and encode are delegated to ffmpeg over pipes: decoded
//! frames arrive as packed RGB24 on the child's stdout, encoded output is
//! fed as packed RGB24 to the child's stdin. `ffprobe` supplies stream
//! metadata up front.

use std::process::Stdio;
use std::time::Duration;

use image::RgbImage;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::error::MediaError;

/// How long to wait for ffprobe before declaring the input unreachable.
/// Network streams can stall indefinitely otherwise.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Video stream metadata extracted by ffprobe.
#[derive(Debug, Clone)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frame count; `None` for streams that do not report one.
    pub frame_count: Option<u64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// Where decoded frames come from.
#[derive(Debug, Clone)]
pub enum DecodeInput {
    File(String),
    Url(String),
    Device(u32),
}

impl DecodeInput {
    /// The ffmpeg/ffprobe input arguments for this source.
    fn input_args(&self) -> Vec<String> {
        match self {
            DecodeInput::File(path) => vec!["-i".into(), path.clone()],
            DecodeInput::Url(url) => {
                if url.starts_with("rtsp://") {
                    vec![
                        "-rtsp_transport".into(),
                        "tcp".into(),
                        "-i".into(),
                        url.clone(),
                    ]
                } else {
                    vec!["-i".into(), url.clone()]
                }
            }
            DecodeInput::Device(index) => vec![
                "-f".into(),
                "v4l2".into(),
                "-i".into(),
                format!("/dev/video{index}"),
            ],
        }
    }

    pub fn display(&self) -> String {
        match self {
            DecodeInput::File(path) => path.clone(),
            DecodeInput::Url(url) => url.clone(),
            DecodeInput::Device(index) => format!("/dev/video{index}"),
        }
    }
}

/// Parse an ffprobe rational like `"30000/1001"` or `"25/1"`.
fn parse_rate(rate: &str) -> Option<f64> {
    let mut parts = rate.splitn(2, '/');
    let num: f64 = parts.next()?.trim().parse().ok()?;
    match parts.next() {
        Some(den) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => Some(num),
    }
}

/// Probe a video input for dimensions, frame rate and frame count.
pub async fn probe_video(input: &DecodeInput) -> Result<VideoProbe, MediaError> {
    let path = input.display();
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames",
        "-of",
        "json",
    ]);
    // ffprobe takes the bare input, not `-i`.
    match input {
        DecodeInput::File(p) => {
            cmd.arg(p);
        }
        DecodeInput::Url(u) => {
            cmd.arg(u);
        }
        DecodeInput::Device(i) => {
            cmd.args(["-f", "v4l2"]);
            cmd.arg(format!("/dev/video{i}"));
        }
    }
    cmd.stdin(Stdio::null());

    let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| MediaError::Probe {
            path: path.clone(),
            reason: format!("timed out after {PROBE_TIMEOUT:?}"),
        })?
        .map_err(|e| MediaError::Probe {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(MediaError::Probe {
            path,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| MediaError::Probe {
            path: path.clone(),
            reason: format!("unreadable ffprobe output: {e}"),
        })?;

    let stream = parsed.streams.into_iter().next().ok_or_else(|| MediaError::Probe {
        path: path.clone(),
        reason: "no video stream".into(),
    })?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(MediaError::Probe {
                path,
                reason: "missing stream dimensions".into(),
            })
        }
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .filter(|f| *f > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .filter(|f| *f > 0.0)
        .unwrap_or(25.0);

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok());

    Ok(VideoProbe {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Build the decode command: raw RGB24 frames on stdout, optionally
/// downsampled to `extract_fps` by ffmpeg's fps filter.
pub fn decoder_command(input: &DecodeInput, extract_fps: Option<f64>) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-v", "error", "-nostdin"]);
    for arg in input.input_args() {
        cmd.arg(arg);
    }
    if let Some(fps) = extract_fps {
        cmd.args(["-vf", &format!("fps={fps}")]);
    }
    cmd.args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Reads fixed-size RGB24 frames from a decoder child process.
#[derive(Debug)]
pub struct RawFrameReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl RawFrameReader {
    pub fn spawn(
        input: &DecodeInput,
        width: u32,
        height: u32,
        extract_fps: Option<f64>,
    ) -> Result<Self, MediaError> {
        let mut child =
            decoder_command(input, extract_fps)
                .spawn()
                .map_err(|e| MediaError::InputOpen {
                    path: input.display(),
                    reason: format!("could not start ffmpeg: {e}"),
                })?;
        let stdout = child.stdout.take().ok_or_else(|| MediaError::InputOpen {
            path: input.display(),
            reason: "ffmpeg stdout unavailable".into(),
        })?;
        Ok(Self {
            child,
            stdout,
            width,
            height,
        })
    }

    /// Read the next decoded frame. `Ok(None)` on end of stream; read errors
    /// also end the stream so a corrupt tail never aborts the run.
    pub async fn next(&mut self) -> Option<RgbImage> {
        let len = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; len];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => RgbImage::from_raw(self.width, self.height, buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => None,
            Err(e) => {
                tracing::warn!("decoder read failed, ending stream: {e}");
                None
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
