// Media input/output for argus.
//
// Provides the Frame value that flows through the inference pipeline and the
// adapters around it:
// - reader.rs / video_reader.rs: frame sources (image, video, directory,
//   stream, device, studio manifest), selected by descriptor inspection
// - sink.rs / video_sink.rs / display_sink.rs: frame sinks, selected by
//   output descriptor
// - draw.rs / blur.rs: visual post-processors applied before the sinks
// - ffmpeg.rs: ffprobe/ffmpeg subprocess plumbing for video decode/encode

pub mod blur;
pub mod draw;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod reader;
pub mod sink;
pub mod video_reader;
pub mod video_sink;

#[cfg(feature = "display")]
pub mod display_sink;

pub use blur::{BlurMethod, BlurOverlay};
pub use draw::DrawOverlay;
pub use error::MediaError;
pub use frame::{Frame, SourceFrame};
pub use reader::{open_source, FrameSource, SourceOptions};
pub use sink::{open_sink, ColorSpace, FrameSink, SinkAction, SinkOptions};
