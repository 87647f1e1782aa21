// Sampled textures with a full mip chain generated on the GPU
//
// Level 0 is uploaded through a staging buffer, the remaining levels are
// produced by repeatedly blitting each level into the next at half size.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::device::GraphicsContext;
use super::image::{record_copy_buffer_to_image, record_layout_transition, GpuImage, ImageDesc};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// floor(log2(max(width, height))) + 1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).max(1).leading_zeros()
}

/// One command of the mip chain generation, in recording order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStep {
    /// Level moves from transfer destination to transfer source
    ToTransferSrc { level: u32 },
    Blit {
        src_level: u32,
        src_size: (i32, i32),
        dst_size: (i32, i32),
    },
    /// Level becomes readable by the fragment shader
    ToShaderRead { level: u32, from: vk::ImageLayout },
}

/// Commands that turn level 0 (in TRANSFER_DST layout, like every other
/// level) into a complete shader-readable mip chain
pub fn mip_steps(width: u32, height: u32, mip_levels: u32) -> Vec<MipStep> {
    let mut steps = Vec::with_capacity(mip_levels as usize * 3);
    let mut mip_width = width as i32;
    let mut mip_height = height as i32;

    for level in 1..mip_levels {
        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);

        steps.push(MipStep::ToTransferSrc { level: level - 1 });
        steps.push(MipStep::Blit {
            src_level: level - 1,
            src_size: (mip_width, mip_height),
            dst_size: (next_width, next_height),
        });
        steps.push(MipStep::ToShaderRead {
            level: level - 1,
            from: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        });

        mip_width = next_width;
        mip_height = next_height;
    }

    // The last level was only ever written to
    steps.push(MipStep::ToShaderRead {
        level: mip_levels.saturating_sub(1),
        from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    });

    steps
}

impl MipStep {
    /// Level and layout change of a barrier step; `None` for blits
    pub fn transition(&self) -> Option<(u32, vk::ImageLayout, vk::ImageLayout)> {
        match *self {
            MipStep::ToTransferSrc { level } => Some((
                level,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )),
            MipStep::Blit { .. } => None,
            MipStep::ToShaderRead { level, from } => {
                Some((level, from, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
            }
        }
    }
}

fn record_mip_step(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    step: MipStep,
) -> Result<()> {
    if let Some((level, old_layout, new_layout)) = step.transition() {
        return record_layout_transition(device, cmd, image, level, 1, old_layout, new_layout);
    }

    if let MipStep::Blit {
        src_level,
        src_size,
        dst_size,
    } = step
    {
        let layers = |mip_level| vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count: 1,
        };
        let blit = vk::ImageBlit {
            src_subresource: layers(src_level),
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: src_size.0, y: src_size.1, z: 1 },
            ],
            dst_subresource: layers(src_level + 1),
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: dst_size.0, y: dst_size.1, z: 1 },
            ],
        };
        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }
    }

    Ok(())
}

/// Decode an image file into 8-bit RGBA pixels
pub fn load_pixels(path: &Path) -> Result<image::RgbaImage> {
    let pixels = image::open(path)
        .with_context(|| format!("Failed to load texture image {:?}", path))?
        .to_rgba8();

    log::info!("Loaded texture {:?} ({}x{})", path, pixels.width(), pixels.height());
    Ok(pixels)
}

/// Mip-mapped image plus the sampler the fragment shader reads it with
pub struct Texture {
    pub sampler: vk::Sampler,
    pub image: GpuImage,
    context: Arc<GraphicsContext>,
}

impl Texture {
    pub fn from_rgba8(
        context: Arc<GraphicsContext>,
        commands: &CommandPool,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("Texture '{}' has no pixels", name);
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            anyhow::bail!(
                "Texture '{}' has {} bytes of pixel data, expected {}",
                name,
                pixels.len(),
                expected
            );
        }

        // Blitting with a linear filter is how the mip chain gets built
        let properties = context.format_properties(TEXTURE_FORMAT);
        if !properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            anyhow::bail!("Texture image format does not support linear blitting");
        }

        let mip_levels = mip_level_count(width, height);
        let extent = vk::Extent2D { width, height };

        let staging = GpuBuffer::staging(context.clone(), &format!("{} staging", name), pixels)?;

        let image = GpuImage::new(
            context.clone(),
            name,
            &ImageDesc {
                extent,
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
            },
        )?;

        commands.one_time_submit(context.graphics_queue, |device, cmd| {
            record_layout_transition(
                device,
                cmd,
                image.image,
                0,
                mip_levels,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            record_copy_buffer_to_image(device, cmd, staging.buffer, image.image, extent);

            for step in mip_steps(width, height, mip_levels) {
                record_mip_step(device, cmd, image.image, step)?;
            }
            Ok(())
        })?;

        log::debug!("Generated {} mip levels for '{}'", mip_levels, name);

        let sampler = Self::create_sampler(&context, mip_levels)?;

        Ok(Self {
            sampler,
            image,
            context,
        })
    }

    fn create_sampler(context: &GraphicsContext, mip_levels: u32) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(context.properties.limits.max_sampler_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        unsafe { context.device.create_sampler(&sampler_info, None) }
            .context("Failed to create texture sampler")
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_sampler(self.sampler, None) };
    }
}
