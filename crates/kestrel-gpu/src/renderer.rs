//! Frame pacing: the acquire, record, submit and present loop.
//!
//! Fences, acquire semaphores and command buffers are indexed by frame slot.
//! Image views and render-complete semaphores are indexed by the acquired
//! image. Submission signals the render-complete semaphore of the image it
//! drew to, and presentation waits on that same semaphore.

use ash::vk;
use kestrel_core::config::{timeout_ns, RendererConfig};
use kestrel_core::constants::DEFAULT_FRAMES_IN_FLIGHT;
use kestrel_core::PresentModePreference;
use tracing::{debug, error, info, warn};

use crate::backend::RenderDevice;
use crate::command::{ColorTarget, FrameSubmit, ImageTransition};
use crate::error::{GpuError, Result};
use crate::frame::FrameSlots;
use crate::surface::DrawableTarget;
use crate::swapchain::{Swapchain, SwapchainImage};

/// Renderer tuning that can be fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererSettings {
    pub frames_in_flight: usize,
    pub present_mode: PresentModePreference,
    /// Fence wait timeout in nanoseconds, `u64::MAX` for none.
    pub fence_timeout_ns: u64,
    /// Image acquire timeout in nanoseconds, `u64::MAX` for none.
    pub acquire_timeout_ns: u64,
    pub clear_color: [f32; 4],
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present_mode: PresentModePreference::default(),
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl From<&RendererConfig> for RendererSettings {
    fn from(config: &RendererConfig) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight,
            present_mode: config.present_mode,
            fence_timeout_ns: timeout_ns(config.fence_timeout_ms),
            acquire_timeout_ns: timeout_ns(config.acquire_timeout_ms),
            clear_color: config.clear_color,
        }
    }
}

/// What the record callback may draw into.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Command buffer in the recording state, inside the color pass.
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// Negotiated swapchain format, for pipelines drawn inside the pass.
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub slot: usize,
    /// Frames presented so far.
    pub frame_number: u64,
}

/// Why a frame produced no submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Acquisition reported the swapchain stale. It was rebuilt.
    SwapchainOutOfDate,
    /// The surface was lost. A rebuild is pending.
    SurfaceLost,
    /// The target closed while minimized. No further frames can be drawn.
    TargetClosed,
}

/// Result of one `draw_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented {
        image_index: u32,
        slot: usize,
        /// The swapchain was rebuilt after presenting.
        swapchain_recreated: bool,
    },
    Skipped(SkipReason),
    /// The fence wait or acquire hit its timeout. Nothing was reset.
    TimedOut,
}

/// Owns the device, the swapchain and the frame slots.
pub struct Renderer<D: RenderDevice> {
    device: D,
    swapchain: Swapchain,
    frames: FrameSlots,
    settings: RendererSettings,
    resize_requested: bool,
    frame_number: u64,
    swapchain_generation: u64,
    shut_down: bool,
}

impl<D: RenderDevice> Renderer<D> {
    /// Allocate frame slots and build the first swapchain, waiting while the
    /// target reports a zero drawable size.
    pub fn new<T: DrawableTarget + ?Sized>(
        device: D,
        target: &mut T,
        settings: RendererSettings,
    ) -> Result<Self> {
        let mut frames = FrameSlots::new(
            &device,
            device.graphics_queue_family(),
            settings.frames_in_flight,
        )?;

        let swapchain = match wait_for_drawable_extent(target)
            .and_then(|extent| Swapchain::create(&device, extent, settings.present_mode))
        {
            Ok(swapchain) => swapchain,
            Err(e) => {
                frames.destroy(&device);
                return Err(e);
            }
        };

        info!(
            "Renderer ready: {} of {} frame slots in flight",
            frames.in_flight_count(),
            frames.capacity()
        );

        Ok(Self {
            device,
            swapchain,
            frames,
            settings,
            resize_requested: false,
            frame_number: 0,
            swapchain_generation: 0,
            shut_down: false,
        })
    }

    pub const fn device(&self) -> &D {
        &self.device
    }

    pub const fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub const fn frames(&self) -> &FrameSlots {
        &self.frames
    }

    pub const fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Frames presented so far.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Bumped on every successful swapchain rebuild.
    pub const fn swapchain_generation(&self) -> u64 {
        self.swapchain_generation
    }

    pub const fn resize_pending(&self) -> bool {
        self.resize_requested
    }

    /// Mark the swapchain stale. Calls before the next frame coalesce.
    pub fn request_resize(&mut self) {
        if !self.resize_requested {
            debug!("Swapchain resize requested");
        }
        self.resize_requested = true;
    }

    /// Change the in-flight count, bounded to `[1, MAX]`. Returns the applied
    /// value. No resources are created or destroyed.
    pub fn set_in_flight_count(&mut self, count: usize) -> usize {
        let applied = self.frames.set_in_flight_count(count);
        self.settings.frames_in_flight = applied;
        info!("Frames in flight: {applied}");
        applied
    }

    pub fn in_flight_count(&self) -> usize {
        self.frames.in_flight_count()
    }

    /// Wait for the GPU to finish all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Run one frame.
    ///
    /// `record` is called inside a dynamic-rendering pass that cleared the
    /// acquired image, between the two layout transitions.
    pub fn draw_frame<T, F>(&mut self, target: &mut T, record: F) -> Result<FrameOutcome>
    where
        T: DrawableTarget + ?Sized,
        F: FnOnce(&D, &FrameContext) -> Result<()>,
    {
        if self.shut_down {
            return Err(GpuError::InvalidState("renderer is shut down".into()));
        }
        if self.resize_requested {
            if let Some(reason) = self.rebuild_or_skip(target)? {
                return Ok(FrameOutcome::Skipped(reason));
            }
        }

        let slot_index = self.frames.current_index();
        let slot = *self.frames.current();

        match self
            .device
            .wait_for_fence(slot.fence, self.settings.fence_timeout_ns)
        {
            Ok(()) => {}
            Err(GpuError::Timeout) => return Ok(FrameOutcome::TimedOut),
            Err(e) => return Err(e),
        }

        let acquired = match self.device.acquire_next_image(
            self.swapchain.handle(),
            slot.image_acquired,
            self.settings.acquire_timeout_ns,
        ) {
            Ok(acquired) => acquired,
            Err(GpuError::SwapchainOutOfDate) => {
                debug!("Acquire reported out of date, rebuilding swapchain");
                let reason = self
                    .rebuild_or_skip(target)?
                    .unwrap_or(SkipReason::SwapchainOutOfDate);
                return Ok(FrameOutcome::Skipped(reason));
            }
            Err(GpuError::SurfaceLost) => {
                warn!("Surface lost during acquire");
                self.resize_requested = true;
                return Ok(FrameOutcome::Skipped(SkipReason::SurfaceLost));
            }
            Err(GpuError::Timeout) => return Ok(FrameOutcome::TimedOut),
            Err(e) => return Err(e),
        };
        let image = self.swapchain.image(acquired.index)?;

        self.device.reset_fence(slot.fence)?;
        // Past this point the slot's fence is unsignaled until a submit lands.
        let submitted = self.record_and_submit(slot_index, acquired.index, image, record);
        if let Err(e) = submitted {
            error!("Frame dropped: {e}");
            self.abandon_slot(slot_index);
            return Err(e);
        }

        let mut stale = acquired.suboptimal;
        match self
            .device
            .present(self.swapchain.handle(), acquired.index, image.render_complete)
        {
            Ok(suboptimal) => stale |= suboptimal,
            Err(GpuError::SwapchainOutOfDate) => stale = true,
            Err(GpuError::SurfaceLost) => {
                warn!("Surface lost during present");
                stale = true;
            }
            Err(e) => {
                error!("Present failed: {e}");
                self.frames.advance();
                self.resize_requested = true;
                return Err(match e {
                    GpuError::Vulkan(code) => GpuError::PresentationFailed(code),
                    other => other,
                });
            }
        }

        self.frames.advance();
        self.frame_number += 1;

        // The frame is already on screen, a deferred rebuild stays pending.
        let swapchain_recreated = stale && self.rebuild_or_skip(target)?.is_none();

        Ok(FrameOutcome::Presented {
            image_index: acquired.index,
            slot: slot_index,
            swapchain_recreated,
        })
    }

    fn record_and_submit<F>(
        &self,
        slot_index: usize,
        image_index: u32,
        image: SwapchainImage,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&D, &FrameContext) -> Result<()>,
    {
        let slot = self.frames.slots()[slot_index];
        let cmd = slot.command_buffer;
        let device = &self.device;

        device.reset_command_pool(slot.command_pool)?;
        device.begin_commands(cmd)?;

        device.cmd_begin_label(cmd, c"color attachment transition", [0.4, 0.4, 0.4, 1.0]);
        device.cmd_transition_image(cmd, &ImageTransition::to_color_attachment(image.image));
        device.cmd_end_label(cmd);

        let extent = self.swapchain.extent();
        device.cmd_begin_label(cmd, c"rendering", [0.2, 0.6, 0.2, 1.0]);
        device.cmd_begin_rendering(
            cmd,
            &ColorTarget {
                view: image.view,
                extent,
                clear: Some(self.settings.clear_color),
            },
        );

        let frame = FrameContext {
            command_buffer: cmd,
            image_index,
            image: image.image,
            view: image.view,
            format: self.swapchain.format().format,
            extent,
            slot: slot_index,
            frame_number: self.frame_number,
        };
        let recorded = record(device, &frame);

        device.cmd_end_rendering(cmd);
        device.cmd_end_label(cmd);
        recorded?;

        device.cmd_begin_label(cmd, c"present transition", [0.4, 0.4, 0.4, 1.0]);
        device.cmd_transition_image(cmd, &ImageTransition::to_present(image.image));
        device.cmd_end_label(cmd);

        device.end_commands(cmd)?;

        device.submit(&FrameSubmit {
            command_buffer: cmd,
            wait: slot.image_acquired,
            wait_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            signal: image.render_complete,
            fence: slot.fence,
        })
    }

    /// Restore a slot whose fence was reset but never submitted, and release
    /// the orphaned acquired image by rebuilding the swapchain next frame.
    fn abandon_slot(&mut self, slot_index: usize) {
        let recovered = self
            .device
            .wait_idle()
            .and_then(|()| self.frames.recover(&self.device, slot_index));
        if let Err(e) = recovered {
            error!("Failed to recover frame slot {slot_index}: {e}");
        }
        self.resize_requested = true;
    }

    /// Rebuild the swapchain. Expected failures become a skip reason with
    /// the rebuild left pending. Anything else is returned.
    fn rebuild_or_skip<T: DrawableTarget + ?Sized>(
        &mut self,
        target: &mut T,
    ) -> Result<Option<SkipReason>> {
        match self.recreate_swapchain(target) {
            Ok(()) => Ok(None),
            Err(e) => match e.skip_reason() {
                Some(reason) => {
                    warn!("Swapchain rebuild deferred: {e}");
                    Ok(Some(reason))
                }
                None => Err(e),
            },
        }
    }

    /// Rebuild the swapchain for the target's current size, blocking while
    /// that size is zero. Keeps the request pending on failure.
    fn recreate_swapchain<T: DrawableTarget + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        self.resize_requested = true;
        let extent = wait_for_drawable_extent(target)?;
        self.swapchain.resize(&self.device, extent)?;
        self.resize_requested = false;
        self.swapchain_generation += 1;
        info!(
            "Swapchain recreated at {}x{}",
            self.swapchain.extent().width,
            self.swapchain.extent().height
        );
        Ok(())
    }

    /// Wait for idle once and release the swapchain and frame slots.
    /// Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down renderer");
        if let Err(e) = self.device.wait_idle() {
            error!("Device idle wait failed during shutdown: {e}");
        }
        self.frames.destroy(&self.device);
        self.swapchain.destroy(&self.device);
    }
}

impl<D: RenderDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll the drawable size, blocking on window events while it is zero.
/// Fails with `TargetClosed` if the target closes first.
fn wait_for_drawable_extent<T: DrawableTarget + ?Sized>(target: &mut T) -> Result<vk::Extent2D> {
    let (mut width, mut height) = target.drawable_size();
    if width == 0 || height == 0 {
        debug!("Drawable size is zero, waiting for the window to be restored");
    }
    while width == 0 || height == 0 {
        if !target.wait_for_events() {
            info!("Target closed while waiting for a drawable size");
            return Err(GpuError::TargetClosed);
        }
        (width, height) = target.drawable_size();
    }
    Ok(vk::Extent2D { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = RendererConfig {
            frames_in_flight: 3,
            fence_timeout_ms: Some(5),
            present_mode: PresentModePreference::Mailbox,
            ..Default::default()
        };
        let settings = RendererSettings::from(&config);
        assert_eq!(settings.frames_in_flight, 3);
        assert_eq!(settings.fence_timeout_ns, 5_000_000);
        assert_eq!(settings.acquire_timeout_ns, u64::MAX);
        assert_eq!(settings.present_mode, PresentModePreference::Mailbox);
    }

    struct Restoring {
        sizes: Vec<(u32, u32)>,
        waits: usize,
    }

    impl DrawableTarget for Restoring {
        fn drawable_size(&self) -> (u32, u32) {
            self.sizes[self.waits.min(self.sizes.len() - 1)]
        }

        fn wait_for_events(&mut self) -> bool {
            self.waits += 1;
            self.waits < self.sizes.len()
        }
    }

    #[test]
    fn drawable_extent_waits_out_minimized_window() {
        let mut target = Restoring {
            sizes: vec![(0, 0), (0, 720), (1280, 720)],
            waits: 0,
        };
        let extent = wait_for_drawable_extent(&mut target).unwrap();
        assert_eq!((extent.width, extent.height), (1280, 720));
        assert_eq!(target.waits, 2);
    }

    #[test]
    fn drawable_extent_gives_up_when_target_closes() {
        let mut target = Restoring {
            sizes: vec![(0, 0), (0, 0)],
            waits: 0,
        };
        assert!(matches!(
            wait_for_drawable_extent(&mut target),
            Err(GpuError::TargetClosed)
        ));
        assert_eq!(target.waits, 2);
    }
}
