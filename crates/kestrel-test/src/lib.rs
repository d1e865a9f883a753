//! Test doubles for the Kestrel renderer.
//!
//! [`MockDevice`] stands in for the GPU and [`ScriptedTarget`] for the
//! window, so the real swapchain and frame loop run without a driver.

pub mod mock;
pub mod target;

pub use mock::{
    AcquireStep, Event, MockDevice, PresentStep, ResourceKind, SubmitRecord, SwapchainRecord,
};
pub use target::ScriptedTarget;

use kestrel_gpu::{Renderer, RendererSettings};

/// A renderer over a fresh [`MockDevice`] with a 1280x720 target.
pub fn mock_renderer(frames_in_flight: usize) -> (Renderer<MockDevice>, ScriptedTarget) {
    let mut target = ScriptedTarget::new(1280, 720);
    let settings = RendererSettings {
        frames_in_flight,
        ..RendererSettings::default()
    };
    match Renderer::new(MockDevice::new(), &mut target, settings) {
        Ok(renderer) => (renderer, target),
        Err(e) => panic!("mock renderer failed to initialize: {e}"),
    }
}
