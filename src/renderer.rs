// Renderer - every GPU resource of the viewer and the per-frame work
//
// Owns the swapchain and everything derived from it, the mesh buffers, the
// texture and the per-slot sync objects. The frame loop drives it through
// the `FrameTarget` steps.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::buffer::GpuBuffer;
use crate::backend::command::CommandPool;
use crate::backend::descriptor::{DescriptorSetLayout, DescriptorSets};
use crate::backend::pipeline::{Pipeline, RenderTargets, ShaderCode};
use crate::backend::shader::load_spirv;
use crate::backend::sync::FrameSync;
use crate::backend::texture::{self, Texture};
use crate::backend::{GraphicsContext, Swapchain};
use crate::config::Config;
use crate::frame::{FrameError, FrameTarget, SwapchainStatus, MAX_FRAMES_IN_FLIGHT};
use crate::mesh::Model;
use crate::uniform::UniformBufferObject;

/// Files read before any window or device exists
pub struct Assets {
    pub model: Model,
    pub texture_path: PathBuf,
    pub texture: image::RgbaImage,
    pub shaders: ShaderCode,
}

impl Assets {
    pub fn load(config: &Config) -> Result<Self> {
        let assets = &config.assets;

        let model = Model::load(&assets.model, &assets.texture_dir)?;

        let texture_path = assets
            .texture
            .clone()
            .or_else(|| model.diffuse_texture.clone())
            .context("No texture configured and the model's material names none")?;
        let texture = texture::load_pixels(&texture_path)?;

        let shaders = ShaderCode {
            vertex: load_spirv(&assets.vertex_shader)?,
            fragment: load_spirv(&assets.fragment_shader)?,
        };

        Ok(Self {
            model,
            texture_path,
            texture,
            shaders,
        })
    }
}

/// Current size of the window's drawable area
pub fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// IMPORTANT: Field order matters for Drop! Fields drop top to bottom, so
/// they are listed in the reverse of the order `new` creates them.
pub struct Renderer {
    // Per-slot state (index = frame slot)
    command_buffers: Vec<vk::CommandBuffer>,
    sync: Vec<FrameSync>,
    descriptors: DescriptorSets,
    uniforms: Vec<GpuBuffer>,

    // Scene
    _texture: Texture,
    index_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    index_count: u32,
    _command_pool: CommandPool,

    // Swapchain-dependent, None only while being rebuilt
    targets: Option<RenderTargets>,
    pipeline: Pipeline,
    descriptor_layout: DescriptorSetLayout,
    swapchain: Option<Swapchain>,

    window: Arc<Window>,
    context: Arc<GraphicsContext>,

    shaders: ShaderCode,
    clear_color: [f32; 4],
    present_mode: vk::PresentModeKHR,
    start_time: Instant,
}

impl Renderer {
    pub fn new(
        context: Arc<GraphicsContext>,
        window: Arc<Window>,
        config: &Config,
        assets: Assets,
    ) -> Result<Self> {
        let present_mode = config.preferred_present_mode();

        // STEP 1: Swapchain, pipeline and the attachments sized to it
        let swapchain = Swapchain::new(context.clone(), window_extent(&window), present_mode)?;
        let descriptor_layout = DescriptorSetLayout::new(context.clone())?;
        let pipeline = Pipeline::new(
            context.clone(),
            swapchain.format,
            descriptor_layout.layout,
            &assets.shaders,
        )?;
        let targets = RenderTargets::new(context.clone(), &pipeline, &swapchain)?;

        // STEP 2: Upload the scene
        let graphics_family = context
            .queue_families
            .graphics
            .context("Graphics queue family missing")?;
        let command_pool = CommandPool::new(context.clone(), graphics_family)?;

        let mesh = &assets.model.mesh;
        let vertex_buffer = GpuBuffer::device_local(
            context.clone(),
            &command_pool,
            "vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )?;
        let index_buffer = GpuBuffer::device_local(
            context.clone(),
            &command_pool,
            "indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )?;

        let (width, height) = assets.texture.dimensions();
        let texture = Texture::from_rgba8(
            context.clone(),
            &command_pool,
            &assets.texture_path.display().to_string(),
            width,
            height,
            assets.texture.as_raw(),
        )?;

        // STEP 3: Per-slot resources
        let uniforms = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|slot| {
                GpuBuffer::new(
                    context.clone(),
                    &format!("uniforms {}", slot),
                    std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let descriptors =
            DescriptorSets::new(context.clone(), &descriptor_layout, &uniforms, &texture)?;

        let sync = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(context.clone()))
            .collect::<Result<Vec<_>>>()?;

        let command_buffers = command_pool.allocate(MAX_FRAMES_IN_FLIGHT as u32)?;

        log::info!(
            "Renderer ready: '{}' with {} indices, {} frames in flight",
            mesh.name,
            mesh.indices.len(),
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            _command_pool: command_pool,
            command_buffers,
            sync,
            descriptors,
            uniforms,
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            _texture: texture,
            targets: Some(targets),
            pipeline,
            descriptor_layout,
            swapchain: Some(swapchain),
            window,
            context,
            shaders: assets.shaders,
            clear_color: config.graphics.clear_color,
            present_mode,
            start_time: Instant::now(),
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn targets(&self) -> Result<&RenderTargets> {
        self.targets.as_ref().context("Render targets not initialized")
    }
}

impl FrameTarget for Renderer {
    fn drawable_extent(&self) -> vk::Extent2D {
        window_extent(&self.window)
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.sync[slot].wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<(u32, SwapchainStatus), FrameError> {
        let semaphore = self.sync[slot].image_available;
        self.swapchain()?.acquire_next_image(semaphore)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.sync[slot].reset()
    }

    fn update_uniforms(&mut self, slot: usize) -> Result<()> {
        let extent = self.swapchain()?.extent;
        let ubo = UniformBufferObject::at(self.start_time.elapsed().as_secs_f32(), extent);
        self.uniforms[slot].write(std::slice::from_ref(&ubo))
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.context.device;
        let cmd = self.command_buffers[slot];
        let extent = self.swapchain()?.extent;
        let framebuffer = *self
            .targets()?
            .framebuffers
            .get(image_index as usize)
            .context("Swapchain image index out of range")?;

        // Clear values are indexed by attachment; the resolve target is not cleared
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.pipeline.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin recording command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptors.sets[slot]],
                &[],
            );
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let sync = &self.sync[slot];

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[slot]];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context.device.queue_submit(
                self.context.graphics_queue,
                &[submit_info],
                sync.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SwapchainStatus, FrameError> {
        let render_finished = self.sync[slot].render_finished;
        self.swapchain()?
            .present(self.context.present_queue, image_index, &[render_finished])
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.context.wait_idle()
    }

    fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        // Only one swapchain may exist for the surface
        self.targets = None;
        self.swapchain = None;

        let swapchain = Swapchain::new(self.context.clone(), extent, self.present_mode)?;

        if swapchain.format != self.pipeline.color_format {
            log::info!(
                "Surface format changed from {:?} to {:?}, rebuilding pipeline",
                self.pipeline.color_format,
                swapchain.format
            );
            self.pipeline = Pipeline::new(
                self.context.clone(),
                swapchain.format,
                self.descriptor_layout.layout,
                &self.shaders,
            )?;
        }

        self.targets = Some(RenderTargets::new(
            self.context.clone(),
            &self.pipeline,
            &swapchain,
        )?);
        self.swapchain = Some(swapchain);

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");
        // Nothing may be in flight when the fields below are destroyed
        if let Err(e) = self.context.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}
