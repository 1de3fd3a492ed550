use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use argus_backend::{select_backend, Backend, BackendOptions};
use argus_media::{
    open_sink, open_source, BlurOverlay, DrawOverlay, FrameSink, FrameSource, SinkOptions,
    SourceOptions,
};
use argus_pipeline::{PipelineConfig, PostProcessor, RunOutcome};

mod cli;

use cli::{Cli, Command, CommonArgs};

fn init_tracing() {
    // LOG_LEVEL takes precedence, then the conventional RUST_LOG. Logs go
    // to stderr so the raw stdout sink stays clean for piping.
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<RunOutcome> {
    let (common, post, fullscreen, noop) = match cli.command {
        Command::Infer(args) => (args.common, Post::None, false, false),
        Command::Draw(args) => (
            args.common,
            Post::Draw {
                labels: args.draw_labels,
                scores: args.draw_scores,
            },
            args.fullscreen,
            false,
        ),
        Command::Blur(args) => (
            args.common,
            Post::Blur {
                method: args.blur_method.into(),
                strength: args.blur_strength,
            },
            args.fullscreen,
            false,
        ),
        Command::Noop(args) => (args.common, Post::Passthrough, false, true),
    };

    let source = open_input(&common).await?;
    let sinks = open_outputs(&common, fullscreen)?;
    let backend = pick_backend(&common, noop).await?;
    tracing::info!(
        input = %common.input,
        outputs = common.outputs.len(),
        backend = backend.is_some(),
        "starting pipeline"
    );
    let post = match post {
        Post::None => PostProcessor::None,
        Post::Passthrough => PostProcessor::Passthrough,
        Post::Draw { labels, scores } => PostProcessor::Draw(DrawOverlay::new(labels, scores)),
        Post::Blur { method, strength } => {
            PostProcessor::Blur(BlurOverlay::new(method, strength))
        }
    };

    let config = PipelineConfig {
        threshold: common.threshold,
        studio_format: common.studio_format,
        ..PipelineConfig::default()
    };

    Ok(argus_pipeline::run(source, sinks, backend, post, config).await)
}

enum Post {
    None,
    Passthrough,
    Draw { labels: bool, scores: bool },
    Blur {
        method: argus_media::BlurMethod,
        strength: u32,
    },
}

async fn open_input(common: &CommonArgs) -> Result<Box<dyn FrameSource>> {
    let opts = SourceOptions {
        input_fps: common.input_fps,
        skip_frame: common.skip_frame,
        recursive: common.recursive,
        reco_tag: common.recognition_id.clone().unwrap_or_default(),
    };
    open_source(&common.input, &opts)
        .await
        .with_context(|| format!("cannot use input '{}'", common.input))
}

fn open_outputs(common: &CommonArgs, fullscreen: bool) -> Result<Vec<Box<dyn FrameSink>>> {
    let opts = SinkOptions {
        json: common.json,
        output_fps: common.output_fps,
        fullscreen,
        color_space: common.output_color_space.into(),
    };
    common
        .outputs
        .iter()
        .map(|descriptor| {
            open_sink(descriptor, &opts)
                .with_context(|| format!("cannot use output '{descriptor}'"))
        })
        .collect()
}

async fn pick_backend(common: &CommonArgs, noop: bool) -> Result<Option<Arc<dyn Backend>>> {
    let opts = if noop {
        BackendOptions {
            noop: true,
            ..BackendOptions::default()
        }
    } else {
        BackendOptions {
            recognition_id: common.recognition_id.clone(),
            amqp_url: common.amqp_url.clone(),
            routing_key: common.routing_key.clone(),
            from_file: common.from_file.clone(),
            noop: false,
        }
    };
    select_backend(&opts)
        .await
        .context("cannot set up the recognition backend")
}
