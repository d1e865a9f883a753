//! The device operations the swapchain and frame loop are written against.
//!
//! [`GpuContext`](crate::GpuContext) implements this with ash. Tests drive
//! the same swapchain and frame logic through a recording double.

use std::ffi::CStr;

use ash::vk;

use crate::command::{ColorTarget, FrameSubmit, ImageTransition};
use crate::error::Result;
use crate::surface::SurfaceSupport;
use crate::swapchain::SwapchainDesc;

/// Successful image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// Still presentable, but no longer matches the surface.
    pub suboptimal: bool,
}

/// Device operations used by [`Swapchain`](crate::Swapchain) and
/// [`Renderer`](crate::Renderer).
///
/// Handle arguments must have been created by the same implementor.
/// Destroy calls on handles the GPU may still use are the caller's bug; the
/// renderer waits for idle first.
pub trait RenderDevice {
    /// Block until all queues are idle.
    fn wait_idle(&self) -> Result<()>;

    /// Family of the queue frames are submitted to.
    fn graphics_queue_family(&self) -> u32;

    fn surface_support(&self) -> Result<SurfaceSupport>;

    /// Build a swapchain. `old` is a recreation hint and may be null.
    fn create_swapchain(&self, desc: &SwapchainDesc, old: vk::SwapchainKHR)
        -> Result<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for `fence`. Expiry of a finite timeout is `GpuError::Timeout`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Reset a pool, recycling every command buffer allocated from it.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;

    /// Acquire the next image, signaling `signal` when it is ready.
    ///
    /// Out-of-date, lost-surface and timeout results come back as their
    /// dedicated `GpuError` variants.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage>;

    /// Begin a one-time-submit recording.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn cmd_transition_image(&self, cmd: vk::CommandBuffer, transition: &ImageTransition);
    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, target: &ColorTarget);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);

    /// Open a debug label region. No-op unless validation is enabled.
    fn cmd_begin_label(&self, _cmd: vk::CommandBuffer, _name: &CStr, _color: [f32; 4]) {}
    fn cmd_end_label(&self, _cmd: vk::CommandBuffer) {}

    /// Submit to the graphics queue. Failures are `GpuError::SubmissionFailed`.
    fn submit(&self, submit: &FrameSubmit) -> Result<()>;

    /// Present `image_index` after `wait` signals. Returns whether the
    /// swapchain is suboptimal.
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool>;
}
