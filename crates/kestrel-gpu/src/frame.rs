//! Per-frame-slot resources.
//!
//! All `MAX_FRAMES_IN_FLIGHT` slots are allocated up front. The in-flight
//! count only changes how many of them the rotation visits.

use ash::vk;
use kestrel_core::constants::MAX_FRAMES_IN_FLIGHT;
use tracing::{debug, warn};

use crate::backend::RenderDevice;
use crate::error::{GpuError, Result};

/// Resources owned by one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the slot's last submission completes.
    pub fence: vk::Fence,
    /// Signaled when the image acquired for this slot is ready.
    pub image_acquired: vk::Semaphore,
}

impl FrameSlot {
    fn create<D: RenderDevice>(device: &D, queue_family: u32) -> Result<Self> {
        let mut slot = Self {
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            image_acquired: vk::Semaphore::null(),
        };
        let result = (|| -> Result<()> {
            slot.command_pool = device.create_command_pool(queue_family)?;
            slot.command_buffer = device.allocate_command_buffer(slot.command_pool)?;
            slot.fence = device.create_fence(true)?;
            slot.image_acquired = device.create_semaphore()?;
            Ok(())
        })();
        match result {
            Ok(()) => Ok(slot),
            Err(e) => {
                slot.destroy(device);
                Err(e)
            }
        }
    }

    fn destroy<D: RenderDevice>(&mut self, device: &D) {
        if self.image_acquired != vk::Semaphore::null() {
            device.destroy_semaphore(self.image_acquired);
            self.image_acquired = vk::Semaphore::null();
        }
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence);
            self.fence = vk::Fence::null();
        }
        // Frees the command buffer with it.
        if self.command_pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
        }
        self.command_buffer = vk::CommandBuffer::null();
    }
}

/// Fixed set of frame slots plus the rotation over the active ones.
pub struct FrameSlots {
    slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT],
    in_flight: usize,
    current: usize,
}

impl FrameSlots {
    /// Allocate every slot and start rotating over `in_flight` of them.
    pub fn new<D: RenderDevice>(device: &D, queue_family: u32, in_flight: usize) -> Result<Self> {
        let mut created: Vec<FrameSlot> = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            match FrameSlot::create(device, queue_family) {
                Ok(slot) => created.push(slot),
                Err(e) => {
                    for slot in &mut created {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        let slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT] = created
            .try_into()
            .map_err(|_| GpuError::InvalidState("frame slot count mismatch".into()))?;
        debug!("Allocated {MAX_FRAMES_IN_FLIGHT} frame slots");

        Ok(Self {
            slots,
            in_flight: clamp_in_flight(in_flight),
            current: 0,
        })
    }

    pub const fn current_index(&self) -> usize {
        self.current
    }

    pub const fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub const fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    /// Number of allocated slots, independent of the in-flight count.
    pub const fn capacity(&self) -> usize {
        MAX_FRAMES_IN_FLIGHT
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Change how many slots the rotation visits. Returns the applied count.
    pub fn set_in_flight_count(&mut self, count: usize) -> usize {
        let clamped = clamp_in_flight(count);
        if clamped != count {
            warn!("In-flight count {count} out of range, using {clamped}");
        }
        self.in_flight = clamped;
        self.current %= clamped;
        clamped
    }

    /// `current = (current + 1) mod in_flight_count`.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.in_flight;
    }

    /// Replace the fence and acquire semaphore of `index` after a frame was
    /// abandoned between fence reset and submission. The device must be idle.
    pub fn recover<D: RenderDevice>(&mut self, device: &D, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        let fence = device.create_fence(true)?;
        let semaphore = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_fence(fence);
                return Err(e);
            }
        };
        device.destroy_fence(std::mem::replace(&mut slot.fence, fence));
        device.destroy_semaphore(std::mem::replace(&mut slot.image_acquired, semaphore));
        debug!("Recovered frame slot {index}");
        Ok(())
    }

    /// Release every slot. The device must be idle.
    pub fn destroy<D: RenderDevice>(&mut self, device: &D) {
        for slot in &mut self.slots {
            slot.destroy(device);
        }
    }
}

/// Bound an in-flight count to `[1, MAX_FRAMES_IN_FLIGHT]`.
pub fn clamp_in_flight(count: usize) -> usize {
    count.clamp(1, MAX_FRAMES_IN_FLIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_is_bounded() {
        assert_eq!(clamp_in_flight(0), 1);
        assert_eq!(clamp_in_flight(2), 2);
        assert_eq!(clamp_in_flight(MAX_FRAMES_IN_FLIGHT + 5), MAX_FRAMES_IN_FLIGHT);
    }
}
