// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Recreated wholesale when the surface changes size or goes out of date.

use anyhow::{Context, Result};
use ash::{extensions::khr, vk};
use std::sync::Arc;

use super::device::{GraphicsContext, Presentation};
use super::image::create_image_view;
use crate::frame::{FrameError, SwapchainStatus};

/// What the surface supports for a given physical device
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(presentation: &Presentation, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let loader = &presentation.loader;
        let surface = presentation.surface;

        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }

    /// One more than the minimum, capped by the maximum (0 means no cap)
    pub fn image_count(&self) -> u32 {
        let caps = &self.capabilities;
        let count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            count.min(caps.max_image_count)
        } else {
            count
        }
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the preferred mode when offered. FIFO is always supported.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface dictates the extent unless it reports the `u32::MAX` wildcard
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    drawable: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: drawable
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: drawable
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    context: Arc<GraphicsContext>,
}

impl Swapchain {
    /// Build a swapchain for the context's surface. Any previous swapchain
    /// for the surface must already be destroyed.
    pub fn new(
        context: Arc<GraphicsContext>,
        drawable: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let presentation = context.presentation()?;
        let support = SwapchainSupport::query(presentation, context.physical_device)?;

        let surface_format =
            choose_surface_format(&support.formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let extent = choose_extent(&support.capabilities, drawable);
        let image_count = support.image_count();

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let families = context.queue_families;
        let family_indices = families.unique();
        let sharing_mode = if family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let swapchain_loader = khr::Swapchain::new(&context.instance, &context.device);

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(presentation.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&family_indices);
        }

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swap chain")?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swap chain images")?;

        log::info!("Created swapchain with {} images", images.len());

        // Build the struct first so Drop cleans up if a view fails
        let mut swapchain = Self {
            swapchain,
            swapchain_loader,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            context,
        };

        for &image in &swapchain.images {
            let view = create_image_view(
                &swapchain.context,
                image,
                swapchain.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            swapchain.image_views.push(view);
        }

        Ok(swapchain)
    }

    /// Acquire next image for rendering, signalling `semaphore` when the
    /// presentation engine releases it
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, SwapchainStatus), FrameError> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }?;

        Ok((index, SwapchainStatus::from_suboptimal(suboptimal)))
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SwapchainStatus, FrameError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe { self.swapchain_loader.queue_present(queue, &present_info) }?;

        Ok(SwapchainStatus::from_suboptimal(suboptimal))
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.context.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    fn support(capabilities: vk::SurfaceCapabilitiesKHR) -> SwapchainSupport {
        SwapchainSupport {
            capabilities,
            formats: vec![],
            present_modes: vec![],
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn extent_follows_surface_unless_wildcard() {
        let drawable = vk::Extent2D { width: 5000, height: 300 };

        let fixed = choose_extent(&caps((800, 600), 2, 3), drawable);
        assert_eq!((fixed.width, fixed.height), (800, 600));

        let clamped = choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), drawable);
        assert_eq!((clamped.width, clamped.height), (4096, 300));
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(support(caps((1, 1), 2, 0)).image_count(), 3);
        assert_eq!(support(caps((1, 1), 2, 8)).image_count(), 3);
        assert_eq!(support(caps((1, 1), 3, 3)).image_count(), 3);
    }
}
