//! `KestrelApp` trait definition.

use kestrel_gpu::{FrameContext, GpuContext};
use winit::event::WindowEvent;

use crate::context::AppContext;

/// Trait for applications driven by [`run_app`](crate::run_app).
///
/// The framework owns the window, the GPU context and the frame loop. The
/// application only records draw commands into each frame's color pass.
pub trait KestrelApp: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the window, GPU context and first swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state. `dt` is the time since the last frame in
    /// seconds.
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Record draw commands.
    ///
    /// `frame.command_buffer` is inside a dynamic-rendering pass that already
    /// cleared the acquired image. Leave the pass open; the framework ends it
    /// and transitions the image for presentation.
    fn record(&mut self, gpu: &GpuContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Called after the swapchain was rebuilt.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a window event. Close and resize requests are already tracked
    /// by the framework.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) {}

    /// Release resources before shutdown. The GPU is idle when this runs.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
