use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use argus_media::{BlurMethod, ColorSpace};

/// Streaming inference over images, videos, directories and live streams.
///
/// Frames are submitted to a recognition backend (cloud API, AMQP worker
/// farm or a pre-recorded prediction file) and results are written in input
/// order to one or more outputs.
#[derive(Parser, Debug)]
#[command(name = "argus", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run recognition and write prediction records.
    Infer(InferArgs),
    /// Run recognition and draw the predicted regions onto the output.
    Draw(DrawArgs),
    /// Run recognition and blur the predicted regions on the output.
    Blur(BlurArgs),
    /// Run the pipeline without a backend; frames pass through unchanged.
    Noop(NoopArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Input descriptor: an image or video file, a directory, a digit-only
    /// device index, a stream URL or a studio JSON manifest.
    #[arg(short = 'i', long, required = true)]
    pub input: String,

    /// One or more output descriptors: image/video/JSON path (printf-style
    /// counters supported), an existing directory, `stdout` or `window`.
    #[arg(short = 'o', long = "outputs", num_args = 1.., required = true)]
    pub outputs: Vec<String>,

    /// Recognition model identifier (cloud or RPC backend).
    #[arg(short = 'r', long = "recognition_id")]
    pub recognition_id: Option<String>,

    /// AMQP broker URL; selects the RPC backend together with the routing
    /// key.
    #[arg(short = 'u', long = "amqp_url")]
    pub amqp_url: Option<String>,

    /// Worker routing key for the RPC backend.
    #[arg(short = 'k', long = "routing_key")]
    pub routing_key: Option<String>,

    /// Score threshold overriding the per-label model thresholds.
    #[arg(short = 't', long, value_parser = parse_threshold)]
    pub threshold: Option<f64>,

    /// Extraction rate for videos; capped at the native frame rate.
    #[arg(long = "input_fps")]
    pub input_fps: Option<u32>,

    /// Frame rate of re-encoded output videos.
    #[arg(long = "output_fps")]
    pub output_fps: Option<u32>,

    /// Keep one of every 1 + skip_frame extracted frames.
    #[arg(long = "skip_frame", default_value_t = 0)]
    pub skip_frame: u32,

    /// Replay predictions from a native or studio JSON file instead of
    /// calling a backend.
    #[arg(long = "from_file")]
    pub from_file: Option<PathBuf>,

    /// Emit studio-shaped prediction JSON.
    #[arg(short = 's', long = "studio_format")]
    pub studio_format: bool,

    /// Recurse into subdirectories of a directory input.
    #[arg(short = 'R', long)]
    pub recursive: bool,

    /// Also write prediction JSON beside image and video outputs.
    #[arg(long)]
    pub json: bool,

    /// Byte order of raw frames written to stdout.
    #[arg(long = "output_color_space", value_enum, default_value = "rgb")]
    pub output_color_space: ColorSpaceArg,
}

#[derive(Args, Debug)]
pub struct InferArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct DrawArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Overlay the prediction scores.
    #[arg(short = 'S', long = "draw_scores")]
    pub draw_scores: bool,

    /// Overlay the prediction labels.
    #[arg(short = 'L', long = "draw_labels")]
    pub draw_labels: bool,

    /// Fullscreen window output.
    #[arg(short = 'F', long)]
    pub fullscreen: bool,
}

#[derive(Args, Debug)]
pub struct BlurArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Blur method applied to each predicted region.
    #[arg(short = 'M', long = "blur_method", value_enum, default_value = "pixel")]
    pub blur_method: BlurMethodArg,

    /// Blur strength.
    #[arg(short = 'B', long = "blur_strength", default_value_t = argus_media::blur::DEFAULT_BLUR_STRENGTH)]
    pub blur_strength: u32,

    /// Fullscreen window output.
    #[arg(short = 'F', long)]
    pub fullscreen: bool,
}

#[derive(Args, Debug)]
pub struct NoopArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

fn parse_threshold(value: &str) -> Result<f64, String> {
    let threshold: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(format!("threshold {threshold} is outside [0, 1]"))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpaceArg {
    Rgb,
    Bgr,
    Gray,
}

impl From<ColorSpaceArg> for ColorSpace {
    fn from(value: ColorSpaceArg) -> Self {
        match value {
            ColorSpaceArg::Rgb => ColorSpace::Rgb,
            ColorSpaceArg::Bgr => ColorSpace::Bgr,
            ColorSpaceArg::Gray => ColorSpace::Gray,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurMethodArg {
    Pixel,
    Gaussian,
    Black,
}

impl From<BlurMethodArg> for BlurMethod {
    fn from(value: BlurMethodArg) -> Self {
        match value {
            BlurMethodArg::Pixel => BlurMethod::Pixel,
            BlurMethodArg::Gaussian => BlurMethod::Gaussian,
            BlurMethodArg::Black => BlurMethod::Black,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_infer_surface() {
        let cli = Cli::try_parse_from([
            "argus",
            "infer",
            "-i",
            "clip.mp4",
            "-o",
            "out_%04d.json",
            "preds",
            "-r",
            "123",
            "-t",
            "0.7",
            "--input_fps",
            "10",
            "--skip_frame",
            "1",
            "-s",
        ])
        .unwrap();
        match cli.command {
            Command::Infer(args) => {
                assert_eq!(args.common.input, "clip.mp4");
                assert_eq!(args.common.outputs.len(), 2);
                assert_eq!(args.common.recognition_id.as_deref(), Some("123"));
                assert_eq!(args.common.threshold, Some(0.7));
                assert_eq!(args.common.input_fps, Some(10));
                assert_eq!(args.common.skip_frame, 1);
                assert!(args.common.studio_format);
            }
            _ => panic!("expected infer"),
        }
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let result = Cli::try_parse_from([
            "argus", "infer", "-i", "a.jpg", "-o", "out.json", "-t", "1.5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn blur_has_method_and_strength_defaults() {
        let cli =
            Cli::try_parse_from(["argus", "blur", "-i", "a.jpg", "-o", "b.jpg"]).unwrap();
        match cli.command {
            Command::Blur(args) => {
                assert_eq!(args.blur_method, BlurMethodArg::Pixel);
                assert_eq!(args.blur_strength, 10);
            }
            _ => panic!("expected blur"),
        }
    }

    #[test]
    fn outputs_are_required() {
        assert!(Cli::try_parse_from(["argus", "infer", "-i", "a.jpg"]).is_err());
    }
}
