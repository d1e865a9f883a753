//! Application context.

use std::time::Instant;

use ash::vk;
use kestrel_core::AppConfig;
use kestrel_gpu::{GpuContext, Renderer};

/// State shared with every [`KestrelApp`](crate::KestrelApp) callback.
pub struct AppContext {
    /// Renderer owning the GPU context, swapchain and frame slots.
    pub renderer: Renderer<GpuContext>,
    /// Configuration the app was started with.
    pub config: AppConfig,
    pub(crate) last_frame_time: Instant,
    pub(crate) exit_requested: bool,
}

impl AppContext {
    pub(crate) fn new(renderer: Renderer<GpuContext>, config: AppConfig) -> Self {
        Self {
            renderer,
            config,
            last_frame_time: Instant::now(),
            exit_requested: false,
        }
    }

    /// GPU context, for allocating buffers and building pipelines.
    pub fn gpu(&self) -> &GpuContext {
        self.renderer.device()
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.swapchain().extent()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Format of the swapchain images pipelines render into.
    pub fn swapchain_format(&self) -> vk::Format {
        self.renderer.swapchain().format().format
    }

    /// Frames presented so far.
    pub fn frame_count(&self) -> u64 {
        self.renderer.frame_number()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.renderer.in_flight_count()
    }

    /// Change the in-flight count. Returns the clamped value applied.
    pub fn set_frames_in_flight(&mut self, count: usize) -> usize {
        self.renderer.set_in_flight_count(count)
    }

    /// Rebuild the swapchain before the next frame.
    pub fn request_resize(&mut self) {
        self.renderer.request_resize();
    }

    /// Leave the main loop after the current frame.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }
}
