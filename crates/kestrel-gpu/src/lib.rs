//! Vulkan presentation layer for the Kestrel renderer.
//!
//! This crate provides:
//! - Instance, debug messenger, surface and device setup
//! - Swapchain creation and recreation
//! - Frame-slot pacing with fences and semaphores
//! - Memory allocation via gpu-allocator
//! - Graphics pipelines for dynamic rendering

pub mod backend;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod renderer;
pub mod surface;
pub mod swapchain;

pub use backend::{AcquiredImage, RenderDevice};
pub use capabilities::{AdapterInfo, GpuVendor};
pub use command::{full_viewport, ColorTarget, FrameSubmit, ImageTransition};
pub use context::GpuContext;
pub use device::{Device, Queue, QueueFamilies};
pub use error::{CapabilityKind, GpuError, QueueClass, Result};
pub use frame::{FrameSlot, FrameSlots};
pub use instance::{DebugMessenger, Instance};
pub use memory::{
    GpuAllocator, GpuBuffer, GpuImage, ImageAspectClass, ImageRequest, MemoryResidency,
};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use renderer::{FrameContext, FrameOutcome, Renderer, RendererSettings, SkipReason};
pub use surface::{DrawableTarget, Surface, SurfaceSource, SurfaceSupport};
pub use swapchain::{Swapchain, SwapchainDesc, SwapchainImage};
