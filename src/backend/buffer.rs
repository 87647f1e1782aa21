// Buffers for vertex, index, uniform and staging data
//
// Memory comes from gpu-allocator. Host-visible locations are persistently
// mapped, so writes are plain copies into the mapped slice.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::CommandPool;
use super::device::GraphicsContext;

/// Buffer and the allocation backing it, released together on drop
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    context: Arc<GraphicsContext>,
}

impl GpuBuffer {
    pub fn new(
        context: Arc<GraphicsContext>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer '{}' would be empty", name);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { context.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let mut gpu_buffer = Self {
            buffer,
            size,
            allocation: None,
            context,
        };

        let requirements =
            unsafe { gpu_buffer.context.device.get_buffer_memory_requirements(buffer) };

        let allocation = gpu_buffer
            .context
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

        unsafe {
            gpu_buffer
                .context
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .with_context(|| format!("Failed to bind memory for buffer '{}'", name))?;
        gpu_buffer.allocation = Some(allocation);

        Ok(gpu_buffer)
    }

    /// Host-visible staging buffer holding a copy of `data`
    pub fn staging<T: Pod>(context: Arc<GraphicsContext>, name: &str, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut staging = Self::new(
            context,
            name,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write(data)?;
        Ok(staging)
    }

    /// Device-local buffer filled through a staging copy. Blocks until the
    /// transfer has completed, after which the staging buffer is released.
    pub fn device_local<T: Pod>(
        context: Arc<GraphicsContext>,
        commands: &CommandPool,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::staging(context.clone(), &format!("{} staging", name), data)?;

        let buffer = Self::new(
            context.clone(),
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        commands.one_time_submit(context.graphics_queue, |device, cmd| {
            record_copy_buffer(device, cmd, &staging, &buffer);
            Ok(())
        })?;

        Ok(buffer)
    }

    /// Copy `data` to the start of the mapped memory
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        if bytes.len() > mapped.len() {
            anyhow::bail!(
                "Write of {} bytes exceeds buffer size of {} bytes",
                bytes.len(),
                mapped.len()
            );
        }

        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy of the buffer's contents, for host-readable locations
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .context("Buffer memory is not host visible")?;

        let len = self.size as usize;
        Ok(bytemuck::pod_collect_to_vec(&mapped[..len]))
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(self.buffer, None) };

        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.context.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Record a full copy of `src` into `dst`
pub fn record_copy_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: &GpuBuffer,
    dst: &GpuBuffer,
) {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: src.size.min(dst.size),
    };

    unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn staged_upload_reads_back_identically() {
        let context = GraphicsContext::headless("buffer-test", false).unwrap();
        let family = context.queue_families.graphics.unwrap();
        let commands = CommandPool::new(context.clone(), family).unwrap();

        let data: Vec<u32> = (0..1024).map(|i| i * 7 + 3).collect();
        let device_buffer = GpuBuffer::device_local(
            context.clone(),
            &commands,
            "readback source",
            vk::BufferUsageFlags::TRANSFER_SRC,
            &data,
        )
        .unwrap();

        let readback = GpuBuffer::new(
            context.clone(),
            "readback",
            device_buffer.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )
        .unwrap();

        commands
            .one_time_submit(context.graphics_queue, |device, cmd| {
                record_copy_buffer(device, cmd, &device_buffer, &readback);
                Ok(())
            })
            .unwrap();

        assert_eq!(readback.read::<u32>().unwrap(), data);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn oversized_write_is_rejected() {
        let context = GraphicsContext::headless("buffer-test", false).unwrap();
        let mut buffer = GpuBuffer::new(
            context,
            "small",
            16,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();

        assert!(buffer.write(&[0u8; 16]).is_ok());
        assert!(buffer.write(&[0u8; 17]).is_err());
    }
}
