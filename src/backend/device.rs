// Graphics context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and debug messenger
// - Surface creation for the window (absent for headless contexts)
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present queues
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use winit::raw_window_handle_05::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

use super::swapchain::SwapchainSupport;

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation is a build-time switch: debug builds require the layer,
/// release builds never load it
pub const ENABLE_VALIDATION: bool = cfg!(debug_assertions);

/// Queue families the renderer needs. Graphics and present may coincide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Headless contexts never present, so only the graphics family counts.
    pub fn is_complete(&self, presenting: bool) -> bool {
        self.graphics.is_some() && (!presenting || self.present.is_some())
    }

    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        self.graphics
            .iter()
            .chain(self.present.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn find(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        presentation: Option<&Presentation>,
    ) -> Result<Self> {
        let families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };

        let mut indices = Self::default();
        for (i, family) in families.iter().enumerate() {
            let index = i as u32;
            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }

            if let Some(presentation) = presentation {
                let supported = unsafe {
                    presentation.loader.get_physical_device_surface_support(
                        physical_device,
                        index,
                        presentation.surface,
                    )
                }?;
                if indices.present.is_none() && supported {
                    indices.present = Some(index);
                }
            }

            if indices.is_complete(presentation.is_some()) {
                break;
            }
        }

        Ok(indices)
    }
}

/// Window surface and the loader that owns its entry points
pub struct Presentation {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
}

/// Vulkan instance, device and allocator shared by every GPU resource.
///
/// Resources hold an `Arc<GraphicsContext>`, so the context is always the
/// last thing destroyed.
pub struct GraphicsContext {
    // Allocator must go before the device it allocates from
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    presentation: Option<Presentation>,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub msaa_samples: vk::SampleCountFlags,
}

impl GraphicsContext {
    /// Create a context that can present to `window`
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `msaa` - Pick the highest usable sample count instead of 1
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        msaa: bool,
        window: &Window,
    ) -> Result<Arc<Self>> {
        Self::create(app_name, enable_validation, msaa, Some(window))
    }

    /// Create a context without a surface, for offscreen work and tests
    pub fn headless(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        Self::create(app_name, enable_validation, false, None)
    }

    fn create(
        app_name: &str,
        enable_validation: bool,
        msaa: bool,
        window: Option<&Window>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating graphics context: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation && !Self::validation_layer_available(&entry)? {
            anyhow::bail!("Validation layers requested, but not available");
        }

        // Step 2: Create instance (debug messenger chained in when validating)
        let instance = Self::create_instance(&entry, app_name, enable_validation, window)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create surface
        let presentation = match window {
            Some(window) => Some(Self::create_surface(&entry, &instance, window)?),
            None => None,
        };

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, presentation.as_ref())?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            presentation.is_some(),
        )?;

        let graphics_family = queue_families
            .graphics
            .context("Graphics queue family missing")?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = match queue_families.present {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => graphics_queue,
        };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let msaa_samples = if msaa {
            max_usable_sample_count(&properties.limits)
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("MSAA samples: {:?}", msaa_samples);

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            presentation,
            debug_utils,
            _entry: entry,
            graphics_queue,
            present_queue,
            queue_families,
            properties,
            msaa_samples,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        Ok(layers
            .iter()
            .any(|layer| name_matches(&layer.layer_name, VALIDATION_LAYER)))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: Option<&Window>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions for whatever platform the window lives on
        let mut extensions: Vec<*const c_char> = match window {
            Some(window) => ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("Failed to query required surface extensions")?
                .to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Covers messages emitted during vkCreateInstance/vkDestroyInstance
        let mut debug_info = debug_messenger_create_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);
        let create_info = debug_messenger_create_info();

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn create_surface(
        entry: &Entry,
        instance: &ash::Instance,
        window: &Window,
    ) -> Result<Presentation> {
        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(Presentation {
            loader: khr::Surface::new(entry, instance),
            surface,
        })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        presentation: Option<&Presentation>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }

        // Score each suitable device (prefer discrete GPU)
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let Some(families) = Self::check_device_suitable(instance, device, presentation)? else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("Failed to find a suitable GPU"))
    }

    /// Returns the queue families when the device can run the renderer
    fn check_device_suitable(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        presentation: Option<&Presentation>,
    ) -> Result<Option<QueueFamilyIndices>> {
        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return Ok(None);
        }

        let families = QueueFamilyIndices::find(instance, device, presentation)?;
        if !families.is_complete(presentation.is_some()) {
            return Ok(None);
        }

        if let Some(presentation) = presentation {
            if !Self::supports_swapchain_extension(instance, device)? {
                return Ok(None);
            }

            let support = SwapchainSupport::query(presentation, device)?;
            if !support.is_adequate() {
                return Ok(None);
            }
        }

        Ok(Some(families))
    }

    fn supports_swapchain_extension(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;

        Ok(extensions
            .iter()
            .any(|ext| name_matches(&ext.extension_name, khr::Swapchain::name())))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        presenting: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presenting {
            vec![khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    /// Window surface. Fails on headless contexts.
    pub fn presentation(&self) -> Result<&Presentation> {
        self.presentation
            .as_ref()
            .context("Graphics context has no surface")
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate whose tiling supports all of `features`
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.format_properties(format);
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .context("Failed to find supported format")
    }

    pub fn find_depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Destroying graphics context...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(presentation) = self.presentation.take() {
                presentation.loader.destroy_surface(presentation.surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Highest sample count usable for both color and depth attachments
pub fn max_usable_sample_count(limits: &vk::PhysicalDeviceLimits) -> vk::SampleCountFlags {
    let counts = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&samples| counts.contains(samples))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Compare a fixed-size, NUL-terminated name from a Vulkan properties struct
fn name_matches(raw: &[c_char], wanted: &CStr) -> bool {
    CStr::from_bytes_until_nul(bytemuck::cast_slice(raw)).is_ok_and(|name| name == wanted)
}

fn debug_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(color: vk::SampleCountFlags, depth: vk::SampleCountFlags) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: color,
            framebuffer_depth_sample_counts: depth,
            ..Default::default()
        }
    }

    #[test]
    fn sample_count_is_limited_by_both_attachments() {
        let all = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        let depth = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;

        assert_eq!(max_usable_sample_count(&limits(all, depth)), vk::SampleCountFlags::TYPE_4);
        assert_eq!(max_usable_sample_count(&limits(all, all)), vk::SampleCountFlags::TYPE_8);
    }

    #[test]
    fn single_sample_when_nothing_else_is_shared() {
        let color = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_8;
        let depth = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;

        assert_eq!(max_usable_sample_count(&limits(color, depth)), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn queue_families_deduplicate() {
        let shared = QueueFamilyIndices { graphics: Some(0), present: Some(0) };
        assert_eq!(shared.unique(), vec![0]);
        assert!(shared.is_complete(true));

        let split = QueueFamilyIndices { graphics: Some(2), present: Some(1) };
        assert_eq!(split.unique(), vec![1, 2]);

        let headless = QueueFamilyIndices { graphics: Some(0), present: None };
        assert!(headless.is_complete(false));
        assert!(!headless.is_complete(true));
    }

    fn fixed_name(name: &str) -> [c_char; vk::MAX_EXTENSION_NAME_SIZE] {
        let mut raw = [0; vk::MAX_EXTENSION_NAME_SIZE];
        for (dst, src) in raw.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }
        raw
    }

    #[test]
    fn layer_and_extension_names_compare_up_to_nul() {
        assert!(name_matches(&fixed_name("VK_LAYER_KHRONOS_validation"), VALIDATION_LAYER));
        assert!(name_matches(&fixed_name("VK_KHR_swapchain"), khr::Swapchain::name()));

        assert!(!name_matches(&fixed_name("VK_LAYER_KHRONOS_validation_extra"), VALIDATION_LAYER));
        assert!(!name_matches(&fixed_name("VK_KHR_swap"), khr::Swapchain::name()));
    }

    #[test]
    fn unterminated_name_never_matches() {
        let raw = [b'A' as c_char; 8];
        assert!(!name_matches(&raw, c"AAAAAAAA"));
    }

    #[test]
    fn debug_messenger_reports_info_and_above() {
        let info = debug_messenger_create_info();
        assert!(info
            .message_severity
            .contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn headless_context_lifecycle() {
        let context = GraphicsContext::headless("context-test", false).unwrap();
        assert!(context.presentation().is_err());
        assert!(context.find_depth_format().is_ok());
        context.wait_idle().unwrap();
    }
}
