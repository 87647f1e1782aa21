// Command pool and one-shot submissions

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::GraphicsContext;

/// Pool whose buffers can be reset individually, one per frame slot
pub struct CommandPool {
    pub pool: vk::CommandPool,
    context: Arc<GraphicsContext>,
}

impl CommandPool {
    pub fn new(context: Arc<GraphicsContext>, queue_family: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { context.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, context })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.context.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Record with `record`, submit to `queue` and block until the queue is
    /// idle. Used for uploads, never on the frame path.
    pub fn one_time_submit<F>(&self, queue: vk::Queue, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.context.device;
        let buffers = self.allocate(1)?;
        let cmd = buffers[0];

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .context("Failed to begin one-time command buffer")?;

            record(device, cmd)?;

            unsafe { device.end_command_buffer(cmd) }
                .context("Failed to end one-time command buffer")?;

            let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
            unsafe {
                device
                    .queue_submit(queue, &[submit_info], vk::Fence::null())
                    .context("Failed to submit one-time command buffer")?;
                device
                    .queue_wait_idle(queue)
                    .context("Failed to wait for transfer queue")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &buffers) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every buffer allocated from the pool
        unsafe { self.context.device.destroy_command_pool(self.pool, None) };
    }
}
