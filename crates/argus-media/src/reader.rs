//! Frame sources and descriptor inspection.
//!
//! The concrete source is selected by looking at the descriptor: an existing
//! file dispatches on its extension (image, video, studio manifest), an
//! existing directory becomes a concatenation of its children, an all-digit
//! string is a capture device and a known URL scheme is a network stream.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::MediaError;
use crate::frame::SourceFrame;
use crate::video_reader::VideoSource;

pub const IMAGE_EXTENSIONS: &[&str] = &["bmp", "jpeg", "jpg", "jpe", "png"];
pub const VIDEO_EXTENSIONS: &[&str] = &["avi", "mp4", "webm", "mjpg"];
pub const STREAM_SCHEMES: &[&str] = &["rtsp", "http", "https"];

/// Options shared by every source variant.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Requested extraction rate for videos; capped at the native rate.
    pub input_fps: Option<u32>,
    /// Keep one of every `1 + skip_frame` extracted frames.
    pub skip_frame: u32,
    /// Recurse into subdirectories of a directory input.
    pub recursive: bool,
    /// Recognition tag appended to frame names.
    pub reco_tag: String,
}

/// An iterator of frames with source-level metadata.
#[async_trait]
pub trait FrameSource: Send + std::fmt::Debug {
    /// Next frame, or `None` when the source is exhausted. A frame that fails
    /// to decode ends the source cleanly; frames already emitted are
    /// unaffected.
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError>;

    /// Total frames this source will yield; `None` when infinite.
    fn frame_count(&self) -> Option<u64>;

    fn fps(&self) -> f64;

    fn is_infinite(&self) -> bool {
        false
    }

    /// Release subprocesses or other resources. Idempotent.
    async fn shutdown(&mut self) {}
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_stream_url(descriptor: &str) -> bool {
    descriptor
        .split_once("://")
        .map(|(scheme, _)| STREAM_SCHEMES.contains(&scheme))
        .unwrap_or(false)
}

/// Display name stem: file stem plus the recognition tag.
fn name_stem(path: &Path, reco: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{stem}_{reco}")
}

/// Open the source matching a descriptor.
pub async fn open_source(
    descriptor: &str,
    opts: &SourceOptions,
) -> Result<Box<dyn FrameSource>, MediaError> {
    let path = Path::new(descriptor);
    if path.exists() {
        if path.is_file() {
            if has_extension(path, IMAGE_EXTENSIONS) {
                return Ok(Box::new(ImageSource::new(path, opts)));
            }
            if has_extension(path, VIDEO_EXTENSIONS) {
                return Ok(Box::new(VideoSource::open_file(path, opts).await?));
            }
            if has_extension(path, &["json"]) {
                return Ok(Box::new(ManifestSource::open(path, opts).await?));
            }
            return Err(MediaError::UnknownInput(descriptor.to_string()));
        }
        if path.is_dir() {
            return Ok(Box::new(DirectorySource::open(path, opts).await?));
        }
        return Err(MediaError::UnknownInput(descriptor.to_string()));
    }
    if !descriptor.is_empty() && descriptor.bytes().all(|b| b.is_ascii_digit()) {
        let index = descriptor.parse().map_err(|_| {
            MediaError::UnknownInput(descriptor.to_string())
        })?;
        return Ok(Box::new(VideoSource::open_device(index, opts).await?));
    }
    if is_stream_url(descriptor) {
        return Ok(Box::new(VideoSource::open_stream(descriptor, opts).await?));
    }
    Err(MediaError::UnknownInput(descriptor.to_string()))
}

/// A single still image: yields exactly one frame.
#[derive(Debug)]
pub struct ImageSource {
    path: PathBuf,
    name: String,
    done: bool,
}

impl ImageSource {
    pub fn new(path: &Path, opts: &SourceOptions) -> Self {
        Self {
            path: path.to_path_buf(),
            name: name_stem(path, &opts.reco_tag),
            done: false,
        }
    }
}

#[async_trait]
impl FrameSource for ImageSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let image = match image::open(&self.path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "skipping undecodable image: {e}");
                return Ok(None);
            }
        };
        Ok(Some(SourceFrame {
            name: self.name.clone(),
            filename: self.path.to_string_lossy().to_string(),
            image,
            video_frame_index: None,
        }))
    }

    fn frame_count(&self) -> Option<u64> {
        Some(1)
    }

    fn fps(&self) -> f64 {
        0.0
    }
}

/// Concatenation of the supported entries of a directory, in lexicographic
/// order. Recursion into subdirectories is opt-in.
#[derive(Debug)]
pub struct DirectorySource {
    children: Vec<Box<dyn FrameSource>>,
    current: usize,
    total: Option<u64>,
}

impl DirectorySource {
    pub fn open<'a>(
        path: &'a Path,
        opts: &'a SourceOptions,
    ) -> BoxFuture<'a, Result<Self, MediaError>> {
        Box::pin(async move {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|e| MediaError::InputOpen {
                    path: path.to_string_lossy().to_string(),
                    reason: e.to_string(),
                })?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            entries.sort();

            let mut children: Vec<Box<dyn FrameSource>> = Vec::new();
            for entry in entries {
                if entry.is_file() {
                    if has_extension(&entry, IMAGE_EXTENSIONS) {
                        children.push(Box::new(ImageSource::new(&entry, opts)));
                    } else if has_extension(&entry, VIDEO_EXTENSIONS) {
                        children.push(Box::new(VideoSource::open_file(&entry, opts).await?));
                    }
                } else if entry.is_dir() && opts.recursive {
                    children.push(Box::new(DirectorySource::open(&entry, opts).await?));
                }
            }

            let total = children
                .iter()
                .map(|c| c.frame_count())
                .try_fold(0u64, |acc, c| c.map(|c| acc + c));

            Ok(Self {
                children,
                current: 0,
                total,
            })
        })
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
        while self.current < self.children.len() {
            if let Some(frame) = self.children[self.current].next_frame().await? {
                return Ok(Some(frame));
            }
            self.children[self.current].shutdown().await;
            self.current += 1;
        }
        Ok(None)
    }

    fn frame_count(&self) -> Option<u64> {
        self.total
    }

    fn fps(&self) -> f64 {
        1.0
    }

    async fn shutdown(&mut self) {
        for child in &mut self.children {
            child.shutdown().await;
        }
    }
}

/// A studio-JSON manifest: a directory-like source over the listed
/// locations. Missing or unsupported locations are logged and skipped.
#[derive(Debug)]
pub struct ManifestSource {
    inner: DirectorySource,
}

impl ManifestSource {
    pub async fn open(path: &Path, opts: &SourceOptions) -> Result<Self, MediaError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            MediaError::InputOpen {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            }
        })?;
        let dataset: argus_formats::studio::StudioDataset = serde_json::from_str(&text)
            .map_err(|e| MediaError::Manifest {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;

        let mut children: Vec<Box<dyn FrameSource>> = Vec::new();
        for image in &dataset.images {
            let location = Path::new(&image.location);
            if !location.is_file() {
                tracing::warn!(location = %image.location, "manifest location missing, skipping");
                continue;
            }
            if has_extension(location, IMAGE_EXTENSIONS) {
                children.push(Box::new(ImageSource::new(location, opts)));
            } else if has_extension(location, VIDEO_EXTENSIONS) {
                children.push(Box::new(VideoSource::open_file(location, opts).await?));
            } else {
                tracing::warn!(location = %image.location, "unsupported manifest location, skipping");
            }
        }

        let total = children
            .iter()
            .map(|c| c.frame_count())
            .try_fold(0u64, |acc, c| c.map(|c| acc + c));

        Ok(Self {
            inner: DirectorySource {
                children,
                current: 0,
                total,
            },
        })
    }
}

#[async_trait]
impl FrameSource for ManifestSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>, MediaError> {
        self.inner.next_frame().await
    }

    fn frame_count(&self) -> Option<u64> {
        self.inner.frame_count()
    }

    fn fps(&self) -> f64 {
        1.0
    }

    async fn shutdown(&mut self) {
        self.inner.shutdown().await;
    }
}
