//! GPU error types.

use std::fmt;

use ash::vk;
use thiserror::Error;

use crate::renderer::SkipReason;

/// Which list a capability name was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    InstanceLayer,
    InstanceExtension,
    DeviceExtension,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InstanceLayer => "instance layer",
            Self::InstanceExtension => "instance extension",
            Self::DeviceExtension => "device extension",
        })
    }
}

/// Workload class a queue family is selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    Graphics,
    Compute,
    Transfer,
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        })
    }
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan API error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Required layers or extensions are not supported by the platform.
    #[error("Unsupported {kind}: {}", missing.join(", "))]
    CapabilityUnsupported {
        kind: CapabilityKind,
        missing: Vec<String>,
    },

    /// No GPU was enumerated.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The selected GPU has no queue family for a required workload class.
    #[error("No queue family supports {0} work")]
    MissingQueueCapability(QueueClass),

    /// Required device extensions are not supported.
    #[error("Missing device extensions: {}", .0.join(", "))]
    MissingExtension(Vec<String>),

    /// Required device features are not supported.
    #[error("Missing device features: {}", .0.join(", "))]
    MissingFeature(Vec<String>),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The presentation surface is gone.
    #[error("Presentation surface lost")]
    SurfaceLost,

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Memory allocation failed.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// The device ran out of memory.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Queue submission failed.
    #[error("Queue submission failed: {0}")]
    SubmissionFailed(vk::Result),

    /// Presentation failed for a reason other than a stale surface.
    #[error("Presentation failed: {0}")]
    PresentationFailed(vk::Result),

    /// The presentation target closed while the renderer waited for it to
    /// become drawable.
    #[error("Presentation target closed")]
    TargetClosed,

    /// A fence wait or image acquire hit its timeout.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Command recording failed.
    #[error("Command recording failed: {0}")]
    Recording(String),

    /// A caller passed an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Expected conditions the frame loop handles by skipping a frame or
    /// rebuilding the swapchain.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SurfaceLost | Self::SwapchainOutOfDate | Self::Timeout
        )
    }

    /// Why a frame is skipped when a swapchain rebuild fails with this error,
    /// or `None` when the failure must reach the caller.
    pub const fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::SwapchainOutOfDate | Self::Timeout => Some(SkipReason::SwapchainOutOfDate),
            Self::SurfaceLost => Some(SkipReason::SurfaceLost),
            Self::TargetClosed => Some(SkipReason::TargetClosed),
            _ => None,
        }
    }

    /// Map the presentation-engine results that have a dedicated variant.
    pub(crate) fn from_present_result(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout,
            other => Self::Vulkan(other),
        }
    }
}

/// Result type for GPU operations.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_results_map_to_recoverable_variants() {
        for code in [
            vk::Result::ERROR_OUT_OF_DATE_KHR,
            vk::Result::ERROR_SURFACE_LOST_KHR,
            vk::Result::TIMEOUT,
            vk::Result::NOT_READY,
        ] {
            assert!(GpuError::from_present_result(code).is_recoverable());
        }
        assert!(!GpuError::from_present_result(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
    }

    #[test]
    fn only_expected_rebuild_failures_skip_the_frame() {
        assert_eq!(
            GpuError::SwapchainOutOfDate.skip_reason(),
            Some(SkipReason::SwapchainOutOfDate)
        );
        assert_eq!(GpuError::SurfaceLost.skip_reason(), Some(SkipReason::SurfaceLost));
        assert_eq!(GpuError::TargetClosed.skip_reason(), Some(SkipReason::TargetClosed));
        assert!(!GpuError::TargetClosed.is_recoverable());
        assert_eq!(GpuError::OutOfDeviceMemory.skip_reason(), None);
        assert_eq!(
            GpuError::SwapchainCreation("bad".into()).skip_reason(),
            None
        );
    }

    #[test]
    fn capability_message_lists_every_missing_name() {
        let err = GpuError::CapabilityUnsupported {
            kind: CapabilityKind::InstanceLayer,
            missing: vec!["A".into(), "B".into()],
        };
        assert_eq!(err.to_string(), "Unsupported instance layer: A, B");
    }
}
