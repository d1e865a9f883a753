//! GPU memory management.
//!
//! A thin layer over gpu-allocator: callers declare usage and residency
//! intent, this module validates it and turns it into allocator parameters.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use tracing::{debug, warn};

use crate::command::single_subresource;
use crate::error::{GpuError, Result};

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryResidency {
    /// Device-local, not CPU visible.
    GpuOnly,
    /// Host-visible and persistently mapped, for uploads.
    CpuToGpu,
    /// Host-visible and cached, for readback.
    GpuToCpu,
}

impl MemoryResidency {
    pub const fn location(self) -> MemoryLocation {
        match self {
            Self::GpuOnly => MemoryLocation::GpuOnly,
            Self::CpuToGpu => MemoryLocation::CpuToGpu,
            Self::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

/// Whether an image holds color or depth data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAspectClass {
    Color,
    Depth,
}

impl ImageAspectClass {
    pub const fn aspect_flags(self) -> vk::ImageAspectFlags {
        match self {
            Self::Color => vk::ImageAspectFlags::COLOR,
            Self::Depth => vk::ImageAspectFlags::DEPTH,
        }
    }
}

/// A single-mip, single-layer 2D image request.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequest<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub width: u32,
    pub height: u32,
    pub aspect: ImageAspectClass,
    pub residency: MemoryResidency,
}

impl ImageRequest<'_> {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image '{}' has zero extent {}x{}",
                self.name, self.width, self.height
            )));
        }
        if self.usage.is_empty() {
            return Err(GpuError::InvalidArgument(format!(
                "image '{}' declares no usage",
                self.name
            )));
        }
        if self.format == vk::Format::UNDEFINED {
            return Err(GpuError::InvalidArgument(format!(
                "image '{}' has an undefined format",
                self.name
            )));
        }
        Ok(())
    }

    fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

fn validate_buffer(size: u64, usage: vk::BufferUsageFlags) -> Result<()> {
    if size == 0 {
        return Err(GpuError::InvalidArgument("buffer size must be non-zero".into()));
    }
    if usage.is_empty() {
        return Err(GpuError::InvalidArgument("buffer declares no usage".into()));
    }
    Ok(())
}

fn allocation_error(e: AllocationError) -> GpuError {
    match e {
        AllocationError::OutOfMemory => GpuError::OutOfDeviceMemory,
        other => GpuError::AllocationFailed(other.to_string()),
    }
}

fn creation_error(e: vk::Result) -> GpuError {
    match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GpuError::OutOfDeviceMemory,
        other => GpuError::Vulkan(other),
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: ash::Device,
}

impl GpuAllocator {
    /// Create a new allocator.
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(allocation_error)?;

        Ok(Self {
            allocator: Some(allocator),
            device: device.clone(),
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate a buffer. `CpuToGpu` and `GpuToCpu` buffers come back mapped.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        residency: MemoryResidency,
        name: &str,
    ) -> Result<GpuBuffer> {
        validate_buffer(size, usage)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the allocator.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(creation_error)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: residency.location(),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error)
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release_unbound(allocation, name);
            return Err(creation_error(e));
        }

        debug!("Allocated buffer '{name}' ({size} bytes, {residency:?})");

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator()?.free(allocation).map_err(allocation_error)?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image together with a view of its single mip and layer.
    pub fn create_image(&mut self, request: &ImageRequest<'_>) -> Result<GpuImage> {
        request.validate()?;
        let create_info = request.create_info();

        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(creation_error)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: request.name,
                    requirements,
                    location: request.residency.location(),
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error)
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(request.format)
            .subresource_range(single_subresource(request.aspect.aspect_flags()));

        let bound_view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| self.device.create_image_view(&view_info, None))
        };
        let view = match bound_view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.release_unbound(allocation, request.name);
                return Err(creation_error(e));
            }
        };

        debug!(
            "Allocated image '{}' ({}x{}, {:?})",
            request.name, request.width, request.height, request.format
        );

        Ok(GpuImage {
            image,
            view,
            allocation: Some(allocation),
            format: request.format,
            extent: create_info.extent,
        })
    }

    /// Free an image, its view and its allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator()?.free(allocation).map_err(allocation_error)?;
        }

        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        image.view = vk::ImageView::null();
        image.image = vk::Image::null();

        Ok(())
    }

    /// Return the allocation of a resource that failed to bind. The bind
    /// error is what the caller reports, a free failure is only logged.
    fn release_unbound(&mut self, allocation: Allocation, name: &str) {
        let freed = self
            .allocator()
            .and_then(|allocator| allocator.free(allocation).map_err(allocation_error));
        log_free_failure(freed, name);
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Must run before the Vulkan device is destroyed. Remaining allocations
    /// are freed and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            debug!("Shutting down GPU allocator");
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Log a failed free. Returns whether the memory was returned.
fn log_free_failure(freed: Result<()>, name: &str) -> bool {
    match freed {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to free allocation for '{name}': {e}");
            false
        }
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Mapped memory, if the buffer is host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        check_write_range(self.size, offset, data.len())?;

        // SAFETY: the range was checked against the allocation size and the
        // mapping stays valid while the allocation is alive.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

fn check_write_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidArgument("write range overflows".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidArgument(format!(
            "write of {len} bytes at {offset} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

/// A GPU image with its view and allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}
