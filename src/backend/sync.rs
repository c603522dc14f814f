// Per-frame synchronization primitives
//
// One bundle per frame slot in the ring. The fence starts signaled so the
// first wait on a fresh slot returns immediately.

use anyhow::{Context, Result};
use ash::vk;

/// Sync objects owned by one frame slot.
///
/// Lifecycle: created once when the ring is sized, destroyed only on ring
/// teardown. Swapchain recreation never touches these.
pub struct FrameSync {
    /// Signaled by the presentation engine when the acquired image is ready.
    pub image_available: vk::Semaphore,
    /// Signaled by the graphics queue when this slot's submission completes.
    pub render_finished: vk::Semaphore,
    /// Signaled when this slot's previous submission fully retires.
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create image-available semaphore")?,
                render_finished: device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create render-finished semaphore")?,
                in_flight_fence: device
                    .create_fence(&fence_info, None)
                    .context("Failed to create in-flight fence")?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
