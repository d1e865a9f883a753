//! Swapchain management.
//!
//! Images, views and render-complete semaphores are kept as three parallel
//! vectors in presentation-engine order, so an acquired image index selects
//! the matching view and semaphore directly.

use ash::vk;
use kestrel_core::PresentModePreference;
use tracing::{debug, info};

use crate::backend::RenderDevice;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceSupport;

/// Everything needed to build a swapchain, negotiated against the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainDesc {
    /// Pick format, present mode, extent and image count for `requested`.
    ///
    /// A zero requested extent is rejected outright. A zero surface extent
    /// (minimized window) reports the swapchain as out of date so the caller
    /// retries later.
    pub fn negotiate(
        support: &SurfaceSupport,
        requested: vk::Extent2D,
        preference: PresentModePreference,
    ) -> Result<Self> {
        if requested.width == 0 || requested.height == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "swapchain extent must be non-zero, got {}x{}",
                requested.width, requested.height
            )));
        }

        let extent = calculate_extent(&support.capabilities, requested);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainOutOfDate);
        }

        Ok(Self {
            surface_format: select_surface_format(&support.formats)?,
            present_mode: select_present_mode(&support.present_modes, preference),
            extent,
            min_image_count: min_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// Presentable image chain with one view and one render-complete semaphore
/// per image.
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    preference: PresentModePreference,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_complete: Vec<vk::Semaphore>,
}

/// The per-image resources for one acquired index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub render_complete: vk::Semaphore,
}

impl Swapchain {
    /// Build a new swapchain for `requested`.
    pub fn create<D: RenderDevice>(
        device: &D,
        requested: vk::Extent2D,
        preference: PresentModePreference,
    ) -> Result<Self> {
        let support = device.surface_support()?;
        let desc = SwapchainDesc::negotiate(&support, requested, preference)?;
        Self::from_desc(device, &desc, preference, vk::SwapchainKHR::null())
    }

    /// Rebuild in place for `requested`.
    ///
    /// Waits for the device to go idle once, releases the per-image
    /// resources, builds a new chain with the current one as its
    /// predecessor, and only then destroys the current chain. If the surface
    /// rejects the request before creation is attempted, the current chain is
    /// kept. Once creation is attempted the current chain is retired and
    /// destroyed even if creation fails, leaving a null handle so the next
    /// attempt passes no predecessor.
    pub fn resize<D: RenderDevice>(&mut self, device: &D, requested: vk::Extent2D) -> Result<()> {
        device.wait_idle()?;
        self.destroy_image_resources(device);

        let support = device.surface_support()?;
        let desc = SwapchainDesc::negotiate(&support, requested, self.preference)?;

        let retired = std::mem::replace(&mut self.handle, vk::SwapchainKHR::null());
        let rebuilt = Self::from_desc(device, &desc, self.preference, retired);
        if retired != vk::SwapchainKHR::null() {
            device.destroy_swapchain(retired);
        }
        *self = rebuilt?;
        Ok(())
    }

    /// Release every owned handle. The device must be idle.
    pub fn destroy<D: RenderDevice>(&mut self, device: &D) {
        self.destroy_image_resources(device);
        if self.handle != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    fn from_desc<D: RenderDevice>(
        device: &D,
        desc: &SwapchainDesc,
        preference: PresentModePreference,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let handle = device.create_swapchain(desc, old)?;

        let mut swapchain = Self {
            handle,
            format: desc.surface_format,
            present_mode: desc.present_mode,
            extent: desc.extent,
            preference,
            images: Vec::new(),
            views: Vec::new(),
            render_complete: Vec::new(),
        };

        if let Err(e) = swapchain.create_image_resources(device) {
            swapchain.destroy(device);
            return Err(e);
        }

        info!(
            "Swapchain ready: {}x{}, {} images, {:?}, {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format.format,
            swapchain.present_mode
        );

        Ok(swapchain)
    }

    fn create_image_resources<D: RenderDevice>(&mut self, device: &D) -> Result<()> {
        self.images = device.swapchain_images(self.handle)?;
        self.views.reserve(self.images.len());
        self.render_complete.reserve(self.images.len());

        for &image in &self.images {
            self.views.push(device.create_image_view(
                image,
                self.format.format,
                vk::ImageAspectFlags::COLOR,
            )?);
            self.render_complete.push(device.create_semaphore()?);
        }
        Ok(())
    }

    fn destroy_image_resources<D: RenderDevice>(&mut self, device: &D) {
        debug!(
            "Releasing {} swapchain views and semaphores",
            self.views.len()
        );
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        for semaphore in self.render_complete.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        self.images.clear();
    }

    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn render_complete_semaphores(&self) -> &[vk::Semaphore] {
        &self.render_complete
    }

    /// Resources for an acquired image index.
    pub fn image(&self, index: u32) -> Result<SwapchainImage> {
        let i = index as usize;
        match (
            self.images.get(i),
            self.views.get(i),
            self.render_complete.get(i),
        ) {
            (Some(&image), Some(&view), Some(&render_complete)) => Ok(SwapchainImage {
                image,
                view,
                render_complete,
            }),
            _ => Err(GpuError::InvalidState(format!(
                "image index {index} out of range for {} swapchain images",
                self.images.len()
            ))),
        }
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".into()))
}

/// Select the preferred present mode, falling back to FIFO (always supported).
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    let preferred = match preference {
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
    };
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
///
/// A fixed surface extent wins. Otherwise the request is clamped into the
/// surface's min/max.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: requested.width.max(min.width).min(max.width),
        height: requested.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, clamped to the maximum when there is one.
pub const fn min_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    const fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn image_count_is_min_plus_one() {
        assert_eq!(min_image_count(&caps(2, 0)), 3);
        assert_eq!(min_image_count(&caps(2, 8)), 3);
    }

    #[test]
    fn image_count_respects_cap() {
        assert_eq!(min_image_count(&caps(3, 3)), 3);
        assert_eq!(min_image_count(&caps(1, 1)), 1);
    }

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            select_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_prefers_requested_then_fifo() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&all, PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&all, PresentModePreference::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], PresentModePreference::Immediate),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_is_flexible() {
        let caps = caps(2, 0);
        assert_eq!(calculate_extent(&caps, extent(1280, 720)), extent(1280, 720));
        assert_eq!(calculate_extent(&caps, extent(9000, 720)), extent(4096, 720));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let mut caps = caps(2, 0);
        caps.current_extent = extent(800, 600);
        assert_eq!(calculate_extent(&caps, extent(1280, 720)), extent(800, 600));
    }

    #[test]
    fn negotiate_rejects_zero_extents() {
        let support = SurfaceSupport {
            capabilities: caps(2, 0),
            formats: vec![format(vk::Format::B8G8R8A8_SRGB)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(matches!(
            SwapchainDesc::negotiate(&support, extent(0, 720), PresentModePreference::Fifo),
            Err(GpuError::InvalidArgument(_))
        ));

        let mut minimized = support.clone();
        minimized.capabilities.current_extent = extent(0, 0);
        assert!(matches!(
            SwapchainDesc::negotiate(&minimized, extent(1280, 720), PresentModePreference::Fifo),
            Err(GpuError::SwapchainOutOfDate)
        ));

        let desc =
            SwapchainDesc::negotiate(&support, extent(1280, 720), PresentModePreference::Immediate)
                .unwrap();
        assert_eq!(desc.min_image_count, 3);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);
    }
}
