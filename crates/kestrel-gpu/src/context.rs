//! GPU context: instance, device, surface and allocator.

use std::ffi::CStr;

use ash::vk;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::backend::{AcquiredImage, RenderDevice};
use crate::capabilities::AdapterInfo;
use crate::command::{ColorTarget, FrameSubmit, ImageTransition};
use crate::device::{Device, Queue};
use crate::error::{GpuError, Result};
use crate::instance::{DebugMessenger, Instance};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage, ImageRequest, MemoryResidency};
use crate::renderer::{Renderer, RendererSettings};
use crate::surface::{DrawableTarget, Surface, SurfaceSource, SurfaceSupport};
use crate::swapchain::SwapchainDesc;

/// Owns every process-lifetime Vulkan object.
///
/// Fields drop in declaration order: allocator, device, surface, debug
/// messenger, instance. Construction failures drop whatever was already
/// built in that same order.
pub struct GpuContext {
    allocator: Mutex<GpuAllocator>,
    device: Device,
    surface: Surface,
    _debug_messenger: Option<DebugMessenger>,
    instance: Instance,
}

impl GpuContext {
    /// Create the instance, surface, device and allocator for `window`.
    pub fn new<W: SurfaceSource + ?Sized>(
        app_name: &str,
        enable_validation: bool,
        window: &W,
    ) -> Result<Self> {
        let platform_extensions = window.required_extensions()?;
        let instance = Instance::new(app_name, enable_validation, &platform_extensions)?;
        let debug_messenger = if enable_validation {
            Some(DebugMessenger::new(&instance)?)
        } else {
            None
        };
        let surface = Surface::new(&instance, window)?;
        let device = Device::select(&instance, &surface)?;
        let allocator = GpuAllocator::new(instance.raw(), device.raw(), device.physical_device())?;

        info!("GPU context initialized for '{app_name}'");

        Ok(Self {
            allocator: Mutex::new(allocator),
            device,
            surface,
            _debug_messenger: debug_messenger,
            instance,
        })
    }

    /// Get the logical device.
    pub const fn device(&self) -> &ash::Device {
        self.device.raw()
    }

    /// Get the Vulkan instance.
    pub const fn instance(&self) -> &ash::Instance {
        self.instance.raw()
    }

    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.device.physical_device()
    }

    pub const fn adapter(&self) -> &AdapterInfo {
        self.device.info()
    }

    pub const fn graphics_queue(&self) -> Queue {
        self.device.graphics_queue()
    }

    /// Dedicated async-compute queue. Selected but not used by the frame loop.
    pub const fn compute_queue(&self) -> Queue {
        self.device.compute_queue()
    }

    /// Transfer queue, sharing the graphics family when none is dedicated.
    pub const fn transfer_queue(&self) -> Queue {
        self.device.transfer_queue()
    }

    pub const fn surface(&self) -> vk::SurfaceKHR {
        self.surface.handle()
    }

    pub const fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }

    /// Allocate a buffer with the given usage and residency.
    pub fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        residency: MemoryResidency,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator
            .lock()
            .create_buffer(size, usage, residency, name)
    }

    /// Allocate an image and its single-mip view.
    pub fn allocate_image(&self, request: &ImageRequest<'_>) -> Result<GpuImage> {
        self.allocator.lock().create_image(request)
    }

    /// The GPU must be done with the buffer.
    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// The GPU must be done with the image.
    pub fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: nothing else can submit while the context is being dropped.
        if let Err(e) = unsafe { self.device.raw().device_wait_idle() } {
            error!("Device idle wait failed while dropping the GPU context: {e}");
        }
        // Allocator memory must go before the device.
        self.allocator.lock().shutdown();
    }
}

impl RenderDevice for GpuContext {
    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device().device_wait_idle()? };
        Ok(())
    }

    fn graphics_queue_family(&self) -> u32 {
        self.device.graphics_queue().family
    }

    fn surface_support(&self) -> Result<SurfaceSupport> {
        self.surface.support(self.physical_device())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old);

        unsafe { self.device.swapchain_loader().create_swapchain(&create_info, None) }.map_err(
            |e| match e {
                vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::SwapchainOutOfDate,
                vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
                other => GpuError::SwapchainCreation(other.to_string()),
            },
        )
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe {
            self.device
                .swapchain_loader()
                .destroy_swapchain(swapchain, None);
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(unsafe {
            self.device
                .swapchain_loader()
                .get_swapchain_images(swapchain)?
        })
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(crate::command::single_subresource(aspect));
        Ok(unsafe { self.device().create_image_view(&create_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device().destroy_image_view(view, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device().create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device().destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device().create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device().destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device().wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device().reset_fences(&[fence])? };
        Ok(())
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        Ok(unsafe { self.device().create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device().destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device()
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device().allocate_command_buffers(&alloc_info)? };
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".into()))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let acquired = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                swapchain,
                timeout_ns,
                signal,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(e) => Err(GpuError::from_present_result(e)),
        }
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device().end_command_buffer(cmd)? };
        Ok(())
    }

    fn cmd_transition_image(&self, cmd: vk::CommandBuffer, transition: &ImageTransition) {
        let barriers = [transition.barrier()];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, target: &ColorTarget) {
        let attachments = [target.attachment()];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(target.render_area())
            .layer_count(1)
            .color_attachments(&attachments);
        unsafe { self.device().cmd_begin_rendering(cmd, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device().cmd_end_rendering(cmd) };
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &CStr, color: [f32; 4]) {
        if let Some(debug_utils) = self.device.debug_utils() {
            let label = vk::DebugUtilsLabelEXT::default()
                .label_name(name)
                .color(color);
            unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
        }
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug_utils) = self.device.debug_utils() {
            unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
        }
    }

    fn submit(&self, submit: &FrameSubmit) -> Result<()> {
        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(submit.wait)
            .stage_mask(submit.wait_stage)];
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(submit.signal)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_buffers =
            [vk::CommandBufferSubmitInfo::default().command_buffer(submit.command_buffer)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signal);

        unsafe {
            self.device().queue_submit2(
                self.device.graphics_queue().handle,
                &[submit_info],
                submit.fence,
            )
        }
        .map_err(GpuError::SubmissionFailed)
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.device.graphics_queue().handle, &present_info)
        };
        match presented {
            Ok(suboptimal) => Ok(suboptimal),
            Err(e @ (vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR)) => {
                Err(GpuError::from_present_result(e))
            }
            Err(e) => Err(GpuError::PresentationFailed(e)),
        }
    }
}

impl Renderer<GpuContext> {
    /// Bring up the full Vulkan stack for `window` and build the first
    /// swapchain.
    pub fn initialize<W>(
        app_name: &str,
        enable_validation: bool,
        window: &mut W,
        settings: RendererSettings,
    ) -> Result<Self>
    where
        W: SurfaceSource + DrawableTarget + ?Sized,
    {
        let context = GpuContext::new(app_name, enable_validation, &*window)?;
        info!("Using {}", context.adapter().summary());
        Self::new(context, window, settings)
    }
}
