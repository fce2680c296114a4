//! Frame pipeline
//!
//! One background worker owns the capture device and every render context.
//! Each iteration captures a frame, tries to detect the board and solve the
//! pose, renders the dependent views, and pushes all results into the
//! bounded [`OutputChannels`]. The consumer only ever reads from the channels.
//!
//! Pattern and pose failures skip the dependent outputs for that iteration.
//! Capture and render failures end the worker; the reason is kept for the
//! caller in [`FramePipeline::stop_reason`].

mod channel;

pub use channel::{
    FrameChannel, OutputChannels, OutputKind, PushOutcome, CHANNEL_CAPACITY, PUSH_TIMEOUT,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use thiserror::Error;

use crate::axis::AxisViewGenerator;
use crate::capture::{CaptureError, FrameSource};
use crate::config::AppConfig;
use crate::pose::PoseEstimator;
use crate::render::composite::add_weighted;
use crate::render::{RenderError, SceneRenderer};
use crate::telemetry::{FrameProfiler, FrameStats};

/// Side of the square marker drawn at the frame centre in camera test mode.
const CENTER_MARKER: u32 = 6;
const OVERLAY_WEIGHT: f32 = 0.7;

/// Why the worker is no longer running.
#[derive(Error, Debug)]
pub enum StopReason {
    #[error("stop requested")]
    Requested,
    #[error("capture failed: {0}")]
    CaptureFailed(#[from] CaptureError),
    #[error("render context failed: {0}")]
    RenderFailed(#[from] RenderError),
    #[error("worker thread panicked")]
    Panicked,
}

impl StopReason {
    /// Whether the worker ended on its own rather than on request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StopReason::Requested)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline resources have been released")]
    Released,
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Counters shared between the worker and the consumer.
#[derive(Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub patterns_found: AtomicU64,
    pub poses_solved: AtomicU64,
    pub pose_failures: AtomicU64,
    /// Queued items evicted to make room for a newer one.
    pub evicted: AtomicU64,
    /// New items discarded because the channel refilled before the retry.
    pub dropped: AtomicU64,
    profiler: Mutex<FrameProfiler>,
}

/// Plain copy of [`PipelineStats`].
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub patterns_found: u64,
    pub poses_solved: u64,
    pub pose_failures: u64,
    pub evicted: u64,
    pub dropped: u64,
    pub timing: FrameStats,
    pub fps: f64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let profiler = self.profiler.lock();
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            patterns_found: self.patterns_found.load(Ordering::Relaxed),
            poses_solved: self.poses_solved.load(Ordering::Relaxed),
            pose_failures: self.pose_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timing: profiler.stats(),
            fps: profiler.fps(),
        }
    }

    fn record_iteration(&self, start: Instant, duration: Duration) {
        self.profiler.lock().record(start, duration);
    }
}

/// What one iteration produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub frame_index: u64,
    pub pattern_found: bool,
    pub pose_solved: bool,
}

/// Everything the worker owns: estimator, renderer and axis plots.
pub struct FrameStage<S: FrameSource, R: SceneRenderer> {
    estimator: PoseEstimator<S>,
    renderer: R,
    axis: AxisViewGenerator,
    camera_test: bool,
    released: bool,
}

impl<S: FrameSource, R: SceneRenderer> FrameStage<S, R> {
    pub fn new(estimator: PoseEstimator<S>, renderer: R, axis: AxisViewGenerator, camera_test: bool) -> Self {
        Self {
            estimator,
            renderer,
            axis,
            camera_test,
            released: false,
        }
    }

    pub fn from_config(source: S, renderer: R, config: &AppConfig) -> Self {
        Self::new(
            PoseEstimator::new(source, config),
            renderer,
            AxisViewGenerator::new(config),
            config.camera_test,
        )
    }

    /// One capture → detect → solve → render → push pass.
    pub fn run_iteration(
        &mut self,
        outputs: &OutputChannels,
        stats: &PipelineStats,
    ) -> Result<IterationReport, StopReason> {
        let frame = self.estimator.capture()?;
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        let mut report = IterationReport {
            frame_index: frame.index,
            pattern_found: false,
            pose_solved: false,
        };
        // Everything is rendered before anything is pushed, so a render
        // failure leaves the channels exactly as the previous iteration did.
        let mut views = None;
        let mut overlay = None;

        if let Some(corners) = self.estimator.detect_pattern(&frame) {
            report.pattern_found = true;
            stats.patterns_found.fetch_add(1, Ordering::Relaxed);

            match self.estimator.solve_pose(&corners) {
                Ok(pose) => {
                    report.pose_solved = true;
                    stats.poses_solved.fetch_add(1, Ordering::Relaxed);

                    let tooth = self.renderer.render_tooth(&pose.render)?;
                    let composite = self.renderer.render_camera_composite(&pose.render)?;
                    if self.camera_test {
                        overlay = Some(self.renderer.render_chessboard(&pose.render)?);
                    }
                    let (front, top, side) = self.axis.create_axis_views(&pose.vision);
                    views = Some([
                        (OutputKind::ArComposite, composite),
                        (OutputKind::Tooth, tooth),
                        (OutputKind::AxisFront, front),
                        (OutputKind::AxisTop, top),
                        (OutputKind::AxisSide, side),
                    ]);
                }
                Err(err) => {
                    log::debug!("frame {}: pose not solved: {}", frame.index, err);
                    stats.pose_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let debug = compose_debug_frame(frame.image, self.camera_test, overlay.as_ref())?;

        let push = |kind: OutputKind, image: RgbImage| match outputs.push(kind, image) {
            PushOutcome::Queued => {}
            PushOutcome::EvictedOldest => {
                stats.evicted.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Dropped => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        };
        for (kind, image) in views.into_iter().flatten() {
            push(kind, image);
        }
        push(OutputKind::Debug, debug);
        Ok(report)
    }

    /// Release the capture device and the render context. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.estimator.release();
        self.renderer.cleanup();
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Raw frame for the debug stream, with the centre marker and board overlay
/// when camera test mode is on.
pub fn compose_debug_frame(
    mut frame: RgbImage,
    camera_test: bool,
    overlay: Option<&RgbImage>,
) -> Result<RgbImage, RenderError> {
    if !camera_test {
        return Ok(frame);
    }

    let (w, h) = frame.dimensions();
    let half = CENTER_MARKER / 2;
    let (cx, cy) = (w / 2, h / 2);
    for y in cy.saturating_sub(half)..(cy + half).min(h) {
        for x in cx.saturating_sub(half)..(cx + half).min(w) {
            frame.put_pixel(x, y, Rgb([255, 0, 0]));
        }
    }

    match overlay {
        Some(overlay) if overlay.dimensions() == (w, h) => {
            add_weighted(&frame, OVERLAY_WEIGHT, overlay, OVERLAY_WEIGHT)
        }
        Some(overlay) => {
            let resized = imageops::resize(overlay, w, h, FilterType::Triangle);
            add_weighted(&frame, OVERLAY_WEIGHT, &resized, OVERLAY_WEIGHT)
        }
        None => Ok(frame),
    }
}

/// Clears the running flag when the worker exits, including by panic.
struct WorkerGuard {
    running: Arc<AtomicBool>,
    stop_reason: Arc<Mutex<Option<Arc<StopReason>>>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut reason = self.stop_reason.lock();
            if reason.is_none() {
                *reason = Some(Arc::new(StopReason::Panicked));
            }
        }
        self.running.store(false, Ordering::Release);
    }
}

/// Runs a [`FrameStage`] on a dedicated worker thread.
pub struct FramePipeline<S: FrameSource + 'static, R: SceneRenderer + 'static> {
    /// Held here until `start`, and again after the worker is joined.
    stage: Option<FrameStage<S, R>>,
    worker: Option<JoinHandle<FrameStage<S, R>>>,
    running: Arc<AtomicBool>,
    outputs: Arc<OutputChannels>,
    stats: Arc<PipelineStats>,
    stop_reason: Arc<Mutex<Option<Arc<StopReason>>>>,
}

impl<S: FrameSource + 'static, R: SceneRenderer + 'static> FramePipeline<S, R> {
    pub fn new(stage: FrameStage<S, R>) -> Self {
        Self {
            stage: Some(stage),
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            outputs: Arc::new(OutputChannels::new()),
            stats: Arc::new(PipelineStats::default()),
            stop_reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Consumer side of the output channels.
    pub fn outputs(&self) -> Arc<OutputChannels> {
        Arc::clone(&self.outputs)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the worker loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Why the worker stopped, once it has.
    pub fn stop_reason(&self) -> Option<Arc<StopReason>> {
        self.stop_reason.lock().clone()
    }

    /// Spawn the worker. The stage can only be started once.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.worker.is_some() {
            return Err(if self.is_running() {
                PipelineError::AlreadyRunning
            } else {
                PipelineError::Released
            });
        }
        let stage = self.stage.take().ok_or(PipelineError::Released)?;
        if stage.is_released() {
            self.stage = Some(stage);
            return Err(PipelineError::Released);
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let outputs = Arc::clone(&self.outputs);
        let stats = Arc::clone(&self.stats);
        let stop_reason = Arc::clone(&self.stop_reason);

        let handle = std::thread::Builder::new()
            .name("frame-pipeline".to_string())
            .spawn(move || worker_loop(stage, running, outputs, stats, stop_reason))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                PipelineError::Spawn(e)
            })?;

        self.worker = Some(handle);
        log::info!("Frame pipeline started");
        Ok(())
    }

    /// Stop the worker after its current iteration and release the capture
    /// device and render context. Safe to call at any time, any number of times.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        let mut acted = false;
        if let Some(handle) = self.worker.take() {
            acted = true;
            match handle.join() {
                Ok(stage) => self.stage = Some(stage),
                Err(_) => {
                    let mut reason = self.stop_reason.lock();
                    if reason.is_none() {
                        *reason = Some(Arc::new(StopReason::Panicked));
                    }
                }
            }
        }
        if let Some(stage) = self.stage.as_mut() {
            acted |= !stage.is_released();
            stage.release();
        }

        let mut reason = self.stop_reason.lock();
        if reason.is_none() {
            *reason = Some(Arc::new(StopReason::Requested));
        }
        if acted {
            if let Some(reason) = reason.as_ref() {
                log::info!("Frame pipeline stopped: {}", reason);
            }
        }
    }
}

impl<S: FrameSource + 'static, R: SceneRenderer + 'static> Drop for FramePipeline<S, R> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<S: FrameSource, R: SceneRenderer>(
    mut stage: FrameStage<S, R>,
    running: Arc<AtomicBool>,
    outputs: Arc<OutputChannels>,
    stats: Arc<PipelineStats>,
    stop_reason: Arc<Mutex<Option<Arc<StopReason>>>>,
) -> FrameStage<S, R> {
    let _guard = WorkerGuard {
        running: Arc::clone(&running),
        stop_reason: Arc::clone(&stop_reason),
    };
    log::info!("Frame pipeline worker running");

    while running.load(Ordering::Acquire) {
        let start = Instant::now();
        match stage.run_iteration(&outputs, &stats) {
            Ok(report) => {
                let elapsed = start.elapsed();
                stats.record_iteration(start, elapsed);
                log::debug!(
                    "frame {}: found={} solved={} in {:.1}ms",
                    report.frame_index,
                    report.pattern_found,
                    report.pose_solved,
                    elapsed.as_secs_f64() * 1000.0
                );
            }
            Err(reason) => {
                log::error!("Frame pipeline halted: {}", reason);
                *stop_reason.lock() = Some(Arc::new(reason));
                stage.release();
                break;
            }
        }
    }
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{CalibrationPattern, PoseEstimator};
    use crate::testutil::{render_board, BoardView, ScriptedSource, StubRenderer};

    fn stage_with(source: ScriptedSource, renderer: StubRenderer, camera_test: bool) -> FrameStage<ScriptedSource, StubRenderer> {
        let view = BoardView::frontal();
        let pattern = CalibrationPattern::new(view.cols, view.rows, view.square_size, (20..50).collect());
        let estimator = PoseEstimator::with_parts(source, pattern, view.intrinsics);
        FrameStage::new(estimator, renderer, AxisViewGenerator::with_font(None), camera_test)
    }

    fn wait_until_halted<S: FrameSource, R: SceneRenderer>(pipeline: &FramePipeline<S, R>) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while pipeline.is_running() {
            assert!(Instant::now() < deadline, "worker did not halt");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn blank() -> RgbImage {
        RgbImage::from_pixel(640, 480, Rgb([200, 200, 200]))
    }

    #[test]
    fn test_stop_before_start_releases_everything() {
        let source = ScriptedSource::new((640, 480));
        let released = source.release_counter();
        let renderer = StubRenderer::new((640, 480));
        let cleanups = Arc::clone(&renderer.cleanups);
        let mut pipeline = FramePipeline::new(stage_with(source, renderer, false));

        pipeline.stop();
        pipeline.stop();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(matches!(pipeline.stop_reason().as_deref(), Some(StopReason::Requested)));
        assert!(matches!(pipeline.start(), Err(PipelineError::Released)));
    }

    #[test]
    fn test_capture_error_halts_and_releases() {
        let source = ScriptedSource::new((640, 480))
            .push_frame(blank())
            .push_error(CaptureError::NoData("unplugged".to_string()));
        let released = source.release_counter();
        let renderer = StubRenderer::new((640, 480));
        let cleanups = Arc::clone(&renderer.cleanups);
        let mut pipeline = FramePipeline::new(stage_with(source, renderer, false));
        let outputs = pipeline.outputs();

        pipeline.start().unwrap();
        wait_until_halted(&pipeline);

        assert!(matches!(
            pipeline.stop_reason().as_deref(),
            Some(StopReason::CaptureFailed(CaptureError::NoData(_)))
        ));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        pipeline.stop();
        pipeline.stop();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(pipeline.stop_reason().is_some_and(|r| r.is_fatal()));
        assert!(outputs.latest(OutputKind::Debug).is_some());
    }

    #[test]
    fn test_missing_pattern_only_feeds_debug() {
        let source = ScriptedSource::new((640, 480)).push_frame(blank()).push_frame(blank());
        let mut pipeline = FramePipeline::new(stage_with(source, StubRenderer::new((640, 480)), true));
        let outputs = pipeline.outputs();
        let stats = pipeline.stats();

        pipeline.start().unwrap();
        wait_until_halted(&pipeline);

        let debug: Vec<_> = outputs.receiver(OutputKind::Debug).try_iter().collect();
        assert_eq!(debug.len(), 2);
        // centre marker is drawn even without a board
        assert_eq!(debug[0].get_pixel(320, 240), &Rgb([255, 0, 0]));
        for kind in [OutputKind::Tooth, OutputKind::ArComposite, OutputKind::AxisFront] {
            assert!(outputs.latest(kind).is_none(), "{:?} should be empty", kind);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.patterns_found, 0);
        assert!(matches!(
            pipeline.stop_reason().as_deref(),
            Some(StopReason::CaptureFailed(CaptureError::EndOfStream))
        ));
    }

    #[test]
    fn test_detected_board_feeds_every_channel() {
        let frame = render_board(&BoardView::frontal());
        let source = ScriptedSource::new((640, 480)).push_frame(frame);
        let renderer = StubRenderer::new((320, 240));
        let mut pipeline = FramePipeline::new(stage_with(source, renderer, true));
        let outputs = pipeline.outputs();

        pipeline.start().unwrap();
        wait_until_halted(&pipeline);

        for kind in OutputKind::ALL {
            let received: Vec<_> = outputs.receiver(kind).try_iter().collect();
            assert_eq!(received.len(), 1, "{:?}", kind);
        }
        assert_eq!(pipeline.stats().snapshot().poses_solved, 1);
    }

    #[test]
    fn test_render_failure_halts() {
        let frame = render_board(&BoardView::frontal());
        let source = ScriptedSource::new((640, 480)).repeat(frame);
        let mut renderer = StubRenderer::new((640, 480));
        renderer.fail_after = Some(0);
        let cleanups = Arc::clone(&renderer.cleanups);
        let mut pipeline = FramePipeline::new(stage_with(source, renderer, false));
        let outputs = pipeline.outputs();

        pipeline.start().unwrap();
        wait_until_halted(&pipeline);

        assert!(matches!(
            pipeline.stop_reason().as_deref(),
            Some(StopReason::RenderFailed(RenderError::Device(_)))
        ));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(outputs.latest(OutputKind::Tooth).is_none());
        // the failing iteration never reached the debug push
        assert!(outputs.latest(OutputKind::Debug).is_none());
    }

    #[test]
    fn test_late_render_failure_pushes_nothing() {
        let frame = render_board(&BoardView::frontal());
        let source = ScriptedSource::new((640, 480)).push_frame(frame);
        let mut renderer = StubRenderer::new((640, 480));
        // tooth renders, the composite fails
        renderer.fail_after = Some(1);
        let calls = Arc::clone(&renderer.calls);
        let mut stage = stage_with(source, renderer, true);
        let outputs = OutputChannels::new();
        let stats = PipelineStats::default();

        let result = stage.run_iteration(&outputs, &stats);
        assert!(matches!(result, Err(StopReason::RenderFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for kind in OutputKind::ALL {
            assert!(outputs.latest(kind).is_none(), "{} was pushed", kind.name());
        }
    }

    #[test]
    fn test_full_channel_counts_eviction() {
        let source = ScriptedSource::new((640, 480)).push_frame(blank());
        let mut stage = stage_with(source, StubRenderer::new((640, 480)), false);
        let outputs = OutputChannels::new();
        for _ in 0..CHANNEL_CAPACITY {
            outputs.push(OutputKind::Debug, RgbImage::new(1, 1));
        }
        let stats = PipelineStats::default();

        stage.run_iteration(&outputs, &stats).unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.evicted, 1);
        assert_eq!(snap.dropped, 0);
        assert_eq!(outputs.channel(OutputKind::Debug).len(), CHANNEL_CAPACITY);
    }

    #[test]
    fn test_stop_interrupts_running_worker() {
        let source = ScriptedSource::new((640, 480)).repeat(blank());
        let released = source.release_counter();
        let mut pipeline = FramePipeline::new(stage_with(source, StubRenderer::new((640, 480)), false));

        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        let stats = pipeline.stats();
        let deadline = Instant::now() + Duration::from_secs(20);
        while stats.frames_captured.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "worker never captured");
            std::thread::sleep(Duration::from_millis(2));
        }
        pipeline.stop();

        assert!(!pipeline.is_running());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(matches!(pipeline.stop_reason().as_deref(), Some(StopReason::Requested)));
    }

    #[test]
    fn test_debug_overlay_is_resized_and_blended() {
        let frame = RgbImage::from_pixel(8, 6, Rgb([100, 100, 100]));
        let overlay = RgbImage::from_pixel(4, 3, Rgb([0, 100, 0]));
        let out = compose_debug_frame(frame.clone(), true, Some(&overlay)).unwrap();
        assert_eq!(out.dimensions(), (8, 6));
        assert_eq!(out.get_pixel(0, 0), &Rgb([70, 140, 70]));
        let centre = out.get_pixel(4, 3).0;
        assert!((178..=179).contains(&centre[0]), "{:?}", centre);
        assert_eq!(&centre[1..], &[70, 0]);

        let untouched = compose_debug_frame(frame.clone(), false, Some(&overlay)).unwrap();
        assert_eq!(untouched, frame);
    }
}
