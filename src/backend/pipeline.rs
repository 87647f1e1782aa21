// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Viewport and scissor are dynamic, so the pipeline survives resizes and is
// rebuilt only when the swapchain format changes.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::GraphicsContext;
use super::image::{GpuImage, ImageDesc};
use super::shader::ShaderModule;
use super::swapchain::Swapchain;
use crate::mesh::Vertex;

/// Attachments of the single render pass, in framebuffer order.
///
/// Multisampled: MSAA color, depth, single-sample resolve (the swapchain
/// image). Single-sampled: swapchain image, depth.
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Vec<vk::AttachmentDescription> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(if multisampled {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        })
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        })
        .build();

    // Depth is not needed after the pass
    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    if !multisampled {
        return vec![color, depth];
    }

    let resolve = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::DONT_CARE)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    vec![color, depth, resolve]
}

/// Image views for one framebuffer, ordered like `attachment_descriptions`
pub fn framebuffer_attachments(
    swapchain_view: vk::ImageView,
    msaa_color_view: Option<vk::ImageView>,
    depth_view: vk::ImageView,
) -> Vec<vk::ImageView> {
    match msaa_color_view {
        Some(color) => vec![color, depth_view, swapchain_view],
        None => vec![swapchain_view, depth_view],
    }
}

/// Create the render pass: one subpass writing color and depth, resolving
/// into the swapchain image when multisampled
fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(color_format, depth_format, samples);

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_refs = [vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref);
    if attachments.len() == 3 {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    let subpasses = [subpass.build()];

    // Wait for the previous frame's use of the attachments (and the
    // presentation engine's read of the image) before writing
    let dependencies = [vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build()];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")
}

/// SPIR-V for the two shader stages
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

/// Render pass, layout and pipeline, built for one color format
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    context: Arc<GraphicsContext>,
}

impl Pipeline {
    pub fn new(
        context: Arc<GraphicsContext>,
        color_format: vk::Format,
        descriptor_layout: vk::DescriptorSetLayout,
        shaders: &ShaderCode,
    ) -> Result<Self> {
        let depth_format = context.find_depth_format()?;
        let samples = context.msaa_samples;

        let render_pass = create_render_pass(&context.device, color_format, depth_format, samples)?;

        let mut pipeline = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            render_pass,
            color_format,
            depth_format,
            samples,
            context,
        };

        let set_layouts = [descriptor_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        pipeline.layout = unsafe {
            pipeline
                .context
                .device
                .create_pipeline_layout(&layout_info, None)
        }
        .context("Failed to create pipeline layout")?;

        pipeline.pipeline = create_graphics_pipeline(
            &pipeline.context.device,
            render_pass,
            pipeline.layout,
            samples,
            shaders,
        )?;

        log::info!(
            "Created graphics pipeline ({:?}, depth {:?}, {:?})",
            color_format,
            depth_format,
            samples
        );

        Ok(pipeline)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            let device = &self.context.device;
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    samples: vk::SampleCountFlags,
    shaders: &ShaderCode,
) -> Result<vk::Pipeline> {
    // Modules are only needed until the pipeline exists
    let vert_module = ShaderModule::new(device, &shaders.vertex)?;
    let frag_module = ShaderModule::new(device, &shaders.fragment)?;

    let entry_point = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module.module)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module.module)
            .name(entry_point)
            .build(),
    ];

    // Vertex input
    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(samples);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Opaque, no blending
    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| e)
    .context("Failed to create graphics pipeline")?;

    pipelines
        .into_iter()
        .next()
        .context("Driver returned no pipeline")
}

/// Everything sized to the swapchain: depth image, optional MSAA color
/// image and one framebuffer per swapchain image
pub struct RenderTargets {
    pub framebuffers: Vec<vk::Framebuffer>,
    // Attachments drop after the framebuffers referencing them
    pub msaa_color: Option<GpuImage>,
    pub depth: GpuImage,
    context: Arc<GraphicsContext>,
}

impl RenderTargets {
    pub fn new(
        context: Arc<GraphicsContext>,
        pipeline: &Pipeline,
        swapchain: &Swapchain,
    ) -> Result<Self> {
        let extent = swapchain.extent;

        let msaa_color = if pipeline.samples != vk::SampleCountFlags::TYPE_1 {
            Some(GpuImage::new(
                context.clone(),
                "msaa color",
                &ImageDesc {
                    extent,
                    format: pipeline.color_format,
                    usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                        | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    aspect: vk::ImageAspectFlags::COLOR,
                    mip_levels: 1,
                    samples: pipeline.samples,
                },
            )?)
        } else {
            None
        };

        let depth = GpuImage::new(
            context.clone(),
            "depth",
            &ImageDesc {
                extent,
                format: pipeline.depth_format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
                mip_levels: 1,
                samples: pipeline.samples,
            },
        )?;

        let mut targets = Self {
            framebuffers: Vec::with_capacity(swapchain.image_views.len()),
            msaa_color,
            depth,
            context,
        };

        for &swapchain_view in &swapchain.image_views {
            let attachments = framebuffer_attachments(
                swapchain_view,
                targets.msaa_color.as_ref().map(|image| image.view),
                targets.depth.view,
            );

            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(pipeline.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { targets.context.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")?;
            targets.framebuffers.push(framebuffer);
        }

        Ok(targets)
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.context.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR: vk::Format = vk::Format::B8G8R8A8_SRGB;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn single_sample_presents_color_directly() {
        let attachments = attachment_descriptions(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1);

        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachments[1].format, DEPTH);
        assert_eq!(attachments[1].store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn multisampled_resolves_into_presented_image() {
        let attachments = attachment_descriptions(COLOR, DEPTH, vk::SampleCountFlags::TYPE_4);

        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_4);

        let resolve = attachments[2];
        assert_eq!(resolve.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(resolve.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(resolve.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn framebuffer_views_follow_attachment_order() {
        use ash::vk::Handle;

        let swapchain = vk::ImageView::from_raw(1);
        let color = vk::ImageView::from_raw(2);
        let depth = vk::ImageView::from_raw(3);

        assert_eq!(
            framebuffer_attachments(swapchain, Some(color), depth),
            vec![color, depth, swapchain]
        );
        assert_eq!(
            framebuffer_attachments(swapchain, None, depth),
            vec![swapchain, depth]
        );
    }
}
