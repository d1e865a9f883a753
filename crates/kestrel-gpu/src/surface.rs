//! Presentation surface and the windowing seams it is created through.

use std::ffi::CStr;

use ash::vk;
use tracing::debug;

use crate::error::Result;
use crate::instance::Instance;

/// Source of a presentation surface, implemented by the windowing layer.
pub trait SurfaceSource {
    /// Instance extensions the platform needs to present to this window.
    fn required_extensions(&self) -> Result<Vec<&'static CStr>>;

    /// Create a surface for this window.
    ///
    /// # Safety
    /// `instance` must have been created with every extension returned by
    /// `required_extensions`, and must outlive the returned surface.
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;
}

/// Drawable-size queries used while (re)building the swapchain.
pub trait DrawableTarget {
    /// Current drawable size in pixels. `(0, 0)` while minimized.
    fn drawable_size(&self) -> (u32, u32);

    /// Block until the windowing system delivers at least one event.
    ///
    /// Returns `false` once the target is closed and will never become
    /// drawable again.
    fn wait_for_events(&mut self) -> bool;
}

/// Owned presentation surface. Destroys the surface on drop.
pub struct Surface {
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Surface {
    pub fn new<S: SurfaceSource + ?Sized>(instance: &Instance, source: &S) -> Result<Self> {
        // SAFETY: the instance was created with the source's required
        // extensions and is dropped after this surface.
        let surface = unsafe { source.create_surface(instance.entry(), instance.raw())? };
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());
        debug!("Presentation surface created");
        Ok(Self { loader, surface })
    }

    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Whether `queue_family` on `physical_device` can present to this surface.
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        // SAFETY: the surface is alive and the physical device belongs to the
        // same instance.
        let supported = unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )?
        };
        Ok(supported)
    }

    /// Query surface capabilities, formats and present modes.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        // SAFETY: as for `supports_present`.
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        debug!("Destroying presentation surface");
        // SAFETY: the swapchain and device are gone before the surface drops.
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
