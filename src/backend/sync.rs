// Synchronization primitives
//
// Fences for GPU-CPU and semaphores for GPU-GPU sync, one set per frame slot

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::GraphicsContext;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    context: Arc<GraphicsContext>,
}

impl FrameSync {
    pub fn new(context: Arc<GraphicsContext>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            context,
        };

        unsafe {
            let device = &sync.context.device;
            sync.image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            sync.render_finished = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create render-finished semaphore")?;
            sync.in_flight_fence = device
                .create_fence(&fence_info, None)
                .context("Failed to create in-flight fence")?;
        }

        Ok(sync)
    }

    /// Block until the slot's last submission has completed
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.context
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed to wait for in-flight fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.context.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset in-flight fence")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            let device = &self.context.device;
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn fence_starts_signaled() {
        let context = GraphicsContext::headless("sync-test", false).unwrap();
        let sync = FrameSync::new(context).unwrap();

        // Would block forever if the fence were created unsignaled
        sync.wait().unwrap();
        sync.reset().unwrap();
    }
}
