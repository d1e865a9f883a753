//! Application runner and main loop.

use std::thread;
use std::time::{Duration, Instant};

use kestrel_core::AppConfig;
use kestrel_gpu::{
    CapabilityKind, FrameOutcome, GpuContext, GpuError, Renderer, RendererSettings,
};
use kestrel_gpu::instance::validation_layers;
use kestrel_platform::PlatformWindow;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::KestrelApp;
use crate::context::AppContext;

/// Consecutive failed frames after which the loop gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 16;

/// Install the `RUST_LOG`-driven fmt subscriber, defaulting to `info`.
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Run a [`KestrelApp`] with the given configuration.
///
/// Initializes logging, creates the window and renderer, and runs the frame
/// loop until the window closes or the app requests exit.
pub fn run_app<A: KestrelApp>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    config.validate()?;

    info!("{} starting...", config.window.title);

    let mut window = PlatformWindow::new(&config.window)?;
    let renderer = match create_renderer(&config, &mut window) {
        Ok(renderer) => renderer,
        Err(e) if matches!(e.downcast_ref::<GpuError>(), Some(GpuError::TargetClosed)) => {
            info!("Window closed before the renderer started");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let target_frame_time = config
        .target_fps
        .filter(|&fps| fps > 0)
        .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

    let mut ctx = AppContext::new(renderer, config);
    let app = A::init(&mut ctx)?;
    info!("Application ready!");

    let mut state = AppState {
        app,
        ctx,
        window,
        target_frame_time,
        stats: FrameStats::default(),
    };
    let result = state.run();
    state.cleanup();
    result
}

/// Build the renderer, retrying without validation when only the
/// validation layer or debug extension is missing.
fn create_renderer(
    config: &AppConfig,
    window: &mut PlatformWindow,
) -> anyhow::Result<Renderer<GpuContext>> {
    let settings = RendererSettings::from(&config.renderer);
    let app_name = &config.renderer.app_name;

    match Renderer::initialize(app_name, config.renderer.validation, window, settings) {
        Ok(renderer) => Ok(renderer),
        Err(e) if config.renderer.validation && is_validation_unavailable(&e) => {
            warn!("{e}; continuing without validation");
            Ok(Renderer::initialize(app_name, false, window, settings)?)
        }
        Err(e) => {
            error!("Failed to initialize renderer: {e}");
            Err(e.into())
        }
    }
}

/// Whether `error` only reports the validation layer or the debug-utils
/// extension as unsupported.
pub(crate) fn is_validation_unavailable(error: &GpuError) -> bool {
    let GpuError::CapabilityUnsupported { kind, missing } = error else {
        return false;
    };
    let optional = match kind {
        CapabilityKind::InstanceLayer => validation_layers(),
        CapabilityKind::InstanceExtension => vec![ash::ext::debug_utils::NAME],
        CapabilityKind::DeviceExtension => return false,
    };
    !missing.is_empty()
        && missing
            .iter()
            .all(|name| optional.iter().any(|o| o.to_string_lossy() == name.as_str()))
}

#[derive(Debug, Default)]
struct FrameStats {
    min_fps: Option<f64>,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
    skipped: u64,
    failed: u64,
}

impl FrameStats {
    fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = Some(self.min_fps.map_or(fps, |min| min.min(fps)));
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.samples += 1;
    }

    fn log(&self, frames: u64) {
        if self.samples == 0 {
            return;
        }
        info!("FPS Statistics:");
        info!("  Min: {:.1}", self.min_fps.unwrap_or_default());
        info!("  Max: {:.1}", self.max_fps);
        info!("  Avg: {:.1}", self.fps_sum / self.samples as f64);
        info!("  Total frames: {frames}");
        info!("  Skipped: {}, failed: {}", self.skipped, self.failed);
    }
}

// Field order is drop order: the renderer's surface goes before the window.
struct AppState<A: KestrelApp> {
    app: A,
    ctx: AppContext,
    window: PlatformWindow,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
}

impl<A: KestrelApp> AppState<A> {
    fn run(&mut self) -> anyhow::Result<()> {
        let mut consecutive_failures = 0;

        loop {
            let frame_start = Instant::now();

            self.window.poll_events();
            for event in self.window.drain_events() {
                self.app.on_event(&mut self.ctx, &event);
            }
            if self.window.should_close() || self.ctx.exit_requested {
                info!("Close requested");
                return Ok(());
            }
            if self.window.take_resize_request() {
                self.ctx.request_resize();
            }

            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;
            self.stats.record(dt);

            self.app.update(&mut self.ctx, dt);

            match self.render_frame() {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    self.stats.failed += 1;
                    consecutive_failures += 1;
                    error!("Render error: {e}");
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e.context(format!(
                            "{consecutive_failures} consecutive frames failed"
                        )));
                    }
                }
            }

            if let Some(target) = self.target_frame_time {
                let elapsed = frame_start.elapsed();
                if elapsed < target {
                    thread::sleep(target - elapsed);
                }
            }
        }
    }

    fn render_frame(&mut self) -> anyhow::Result<()> {
        let generation = self.ctx.renderer.swapchain_generation();
        let app = &mut self.app;

        let outcome = self
            .ctx
            .renderer
            .draw_frame(&mut self.window, |gpu, frame| {
                app.record(gpu, frame)
                    .map_err(|e| GpuError::Recording(format!("{e:#}")))
            });

        // A failed frame may still have rebuilt the swapchain.
        if self.ctx.renderer.swapchain_generation() != generation {
            let (width, height) = (self.ctx.width(), self.ctx.height());
            self.app.on_resize(&mut self.ctx, width, height)?;
            info!("Resized to {width}x{height}");
        }

        match outcome? {
            FrameOutcome::Presented { .. } => {}
            FrameOutcome::Skipped(reason) => {
                self.stats.skipped += 1;
                debug!("Frame skipped: {reason:?}");
            }
            FrameOutcome::TimedOut => {
                self.stats.skipped += 1;
                warn!("Frame timed out waiting for the GPU");
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.stats.log(self.ctx.frame_count());

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.renderer.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        self.ctx.renderer.shutdown();
        info!("Cleanup complete");
    }
}
