//! Dental AR preview
//!
//! Entry point: loads the config, opens the frame source and renderer, runs
//! the pipeline and plays the display consumer until the worker stops.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use dental_ar::capture::{FrameSource, ReplaySource};
use dental_ar::pipeline::{FramePipeline, FrameStage, OutputKind};
use dental_ar::render::{ArSceneRenderer, GpuRasterizer, SceneAssets};
use dental_ar::AppConfig;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "dental-ar", version, about = "Live chessboard-tracked dental AR preview")]
struct Args {
    /// JSON config file; missing keys use defaults
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Replay still images from a directory instead of opening the camera
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// Loop the replay directory
    #[arg(long = "loop")]
    looping: bool,

    /// Stop after this many captured frames
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Write the latest image of every output as PNG into this directory
    #[arg(long, value_name = "DIR")]
    dump: Option<PathBuf>,

    /// Save the default config to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        AppConfig::default()
            .save_to_file(path)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        return Ok(());
    }

    log::info!("Dental AR starting...");
    let config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    let source = open_source(&args, &config)?;
    let assets = SceneAssets::load(&config.mesh_dir)
        .with_context(|| format!("loading meshes from {}", config.mesh_dir.display()))?;
    let [width, height] = config.render_size;
    let rasterizer = GpuRasterizer::new(width, height).context("creating offscreen renderer")?;
    let renderer = ArSceneRenderer::new(rasterizer, assets, &config).context("building scenes")?;

    let mut pipeline = FramePipeline::new(FrameStage::from_config(source, renderer, &config));
    pipeline.start()?;

    if let Some(dir) = &args.dump {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let consumed = run_consumer(&pipeline, &config, &args);
    pipeline.stop();
    consumed?;

    let snap = pipeline.stats().snapshot();
    log::info!(
        "Captured {} frames, board found in {}, {} poses solved, {} stale images evicted, {} dropped",
        snap.frames_captured,
        snap.patterns_found,
        snap.poses_solved,
        snap.evicted,
        snap.dropped
    );
    match pipeline.stop_reason() {
        Some(reason) if reason.is_fatal() => {
            log::error!("Pipeline ended: {}", reason);
            anyhow::bail!("pipeline ended: {}", reason)
        }
        _ => {
            log::info!("Dental AR exiting");
            Ok(())
        }
    }
}

fn open_source(args: &Args, config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    if let Some(dir) = &args.replay {
        let source = ReplaySource::open(dir, args.looping)
            .with_context(|| format!("opening replay directory {}", dir.display()))?;
        return Ok(Box::new(source));
    }
    open_camera(config)
}

#[cfg(feature = "camera")]
fn open_camera(config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    let [width, height] = config.camera_resolution;
    let device = dental_ar::capture::CameraDevice::open(config.camera_id, width, height, config.camera_fps)
        .context("opening camera")?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "camera"))]
fn open_camera(_config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!("built without the `camera` feature; use --replay DIR")
}

/// Poll every output at the display rate until the worker stops or the
/// frame limit is reached.
fn run_consumer<S, R>(pipeline: &FramePipeline<S, R>, config: &AppConfig, args: &Args) -> Result<()>
where
    S: FrameSource + 'static,
    R: dental_ar::render::SceneRenderer + 'static,
{
    let outputs = pipeline.outputs();
    let stats = pipeline.stats();
    let interval = config.ui_interval();
    let mut last_summary = Instant::now();
    let mut received = [0u64; 6];

    while pipeline.is_running() {
        for kind in OutputKind::ALL {
            if let Some(image) = outputs.latest(kind) {
                received[kind.index()] += 1;
                if let Some(dir) = &args.dump {
                    save_output(dir, kind, &image)?;
                }
            }
        }

        if last_summary.elapsed() >= SUMMARY_INTERVAL {
            let snap = stats.snapshot();
            log::info!(
                "{:.1} fps, iteration avg {:.1}ms p95 {:.1}ms, found {}/{}, composites shown {}",
                snap.fps,
                snap.timing.avg_ms,
                snap.timing.p95_ms,
                snap.patterns_found,
                snap.frames_captured,
                received[OutputKind::ArComposite.index()]
            );
            last_summary = Instant::now();
        }

        if args
            .frames
            .is_some_and(|limit| stats.frames_captured.load(std::sync::atomic::Ordering::Relaxed) >= limit)
        {
            log::info!("Frame limit reached");
            break;
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

fn save_output(dir: &Path, kind: OutputKind, image: &image::RgbImage) -> Result<()> {
    let path = dir.join(format!("{}.png", kind.name()));
    image
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))
}
