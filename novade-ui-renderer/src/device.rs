//! Device bootstrap: instance, debug messenger, presentation surface, physical
//! device selection and the logical device with its single queue.
//!
//! Everything created here lives for the whole renderer lifetime and is owned
//! by [`GpuContext`]. Subordinate modules receive only the handles they need.

use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::error::{RendererError, Result, Subsystem, VkResultExt};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = *p_callback_data;
    let message_id_name = if callback_data.p_message_id_name.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::debug!(
                target: "vulkan",
                "{:?} [{}] {}",
                message_type,
                message_id_name,
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(
                target: "vulkan",
                "{:?} [{}] {}",
                message_type,
                message_id_name,
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(
                target: "vulkan",
                "{:?} [{}] {}",
                message_type,
                message_id_name,
                message
            );
        }
        _ => {
            tracing::error!(
                target: "vulkan",
                "{:?} [{}] {}",
                message_type,
                message_id_name,
                message
            );
        }
    }
    vk::FALSE
}

/// Presentation surface plus the loader needed to query and destroy it.
pub struct PresentationTarget {
    pub loader: Surface,
    pub surface: vk::SurfaceKHR,
}

/// Root owner of the Vulkan instance and logical device.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    target: Option<PresentationTarget>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_index: u32,
    device: Arc<ash::Device>,
    queue: vk::Queue,
}

impl GpuContext {
    /// Creates the instance, a surface for `window`, and a device whose queue
    /// family supports both graphics and presentation to that surface.
    pub fn new<W>(window: &W, config: &RendererConfig) -> Result<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let entry = unsafe { ash::Entry::load()? };
        let display_handle = window.raw_display_handle();
        let (instance, debug_utils) = create_instance(&entry, config, Some(display_handle))?;

        let created = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle,
                window.raw_window_handle(),
                None,
            )
        };
        let surface = match created {
            Ok(surface) => surface,
            Err(result) => {
                unsafe { destroy_instance_objects(&instance, debug_utils.as_ref(), None) };
                return Err(result).in_subsystem(Subsystem::DeviceBootstrap, "vkCreateSurfaceKHR");
            }
        };
        let target = PresentationTarget {
            loader: Surface::new(&entry, &instance),
            surface,
        };
        info!("Vulkan surface created.");

        Self::finish(entry, instance, debug_utils, Some(target))
    }

    /// Creates a device without any presentation surface. Used to drive the
    /// memory pool and atlas uploads offscreen.
    pub fn new_headless(config: &RendererConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };
        let (instance, debug_utils) = create_instance(&entry, config, None)?;
        Self::finish(entry, instance, debug_utils, None)
    }

    fn finish(
        entry: ash::Entry,
        instance: ash::Instance,
        debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
        target: Option<PresentationTarget>,
    ) -> Result<Self> {
        let selection = match select_physical_device(&instance, target.as_ref()) {
            Ok(selection) => selection,
            Err(err) => {
                unsafe {
                    destroy_instance_objects(&instance, debug_utils.as_ref(), target.as_ref())
                };
                return Err(err);
            }
        };
        let (physical_device, queue_family_index) = selection;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let device = match create_logical_device(
            &instance,
            physical_device,
            queue_family_index,
            target.is_some(),
        ) {
            Ok(device) => device,
            Err(err) => {
                unsafe {
                    destroy_instance_objects(&instance, debug_utils.as_ref(), target.as_ref())
                };
                return Err(err);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        info!(
            "Using {} (queue family {}, api {}.{}.{}).",
            device_name.to_string_lossy(),
            queue_family_index,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
        );

        Ok(Self {
            entry,
            instance,
            debug_utils,
            target,
            physical_device,
            properties,
            memory_properties,
            queue_family_index,
            device: Arc::new(device),
            queue,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// The presentation surface, absent for headless contexts.
    pub fn presentation_target(&self) -> Option<&PresentationTarget> {
        self.target.as_ref()
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .in_subsystem(Subsystem::DeviceBootstrap, "vkDeviceWaitIdle")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            debug!("Vulkan logical device destroyed.");
            destroy_instance_objects(
                &self.instance,
                self.debug_utils.as_ref(),
                self.target.as_ref(),
            );
        }
        info!("GPU context destroyed.");
    }
}

unsafe fn destroy_instance_objects(
    instance: &ash::Instance,
    debug_utils: Option<&(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    target: Option<&PresentationTarget>,
) {
    if let Some(target) = target {
        target.loader.destroy_surface(target.surface, None);
    }
    if let Some((loader, messenger)) = debug_utils {
        loader.destroy_debug_utils_messenger(*messenger, None);
    }
    instance.destroy_instance(None);
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    match entry.enumerate_instance_layer_properties() {
        Ok(layers) => layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER),
        Err(_) => false,
    }
}

fn create_instance(
    entry: &ash::Entry,
    config: &RendererConfig,
    display_handle: Option<RawDisplayHandle>,
) -> Result<(ash::Instance, Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>)> {
    let app_name = CString::new(config.application_name.replace('\0', "")).unwrap_or_default();
    let engine_name = CString::new("novade-ui-renderer").unwrap_or_default();

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut extensions: Vec<*const c_char> = match display_handle {
        Some(handle) => ash_window::enumerate_required_extensions(handle)
            .in_subsystem(Subsystem::DeviceBootstrap, "enumerate surface extensions")?
            .to_vec(),
        None => Vec::new(),
    };

    let enable_validation = if config.enable_validation && !validation_layer_available(entry) {
        warn!(
            "Validation requested but VK_LAYER_KHRONOS_validation is not installed; \
             continuing without it."
        );
        false
    } else {
        config.enable_validation
    };

    let mut layers: Vec<*const c_char> = Vec::new();
    if enable_validation {
        extensions.push(DebugUtils::name().as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let mut messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let mut instance_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    if enable_validation {
        instance_info = instance_info.push_next(&mut messenger_info);
    }

    let instance = unsafe { entry.create_instance(&instance_info, None) }
        .in_subsystem(Subsystem::DeviceBootstrap, "vkCreateInstance")?;
    info!("Vulkan instance created (validation: {}).", enable_validation);

    let debug_utils = if enable_validation {
        let loader = DebugUtils::new(entry, &instance);
        match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
            Ok(messenger) => Some((loader, messenger)),
            Err(err) => {
                warn!("Failed to create debug messenger: {}", err);
                None
            }
        }
    } else {
        None
    };

    Ok((instance, debug_utils))
}

/// Picks the first queue family offering graphics and, when `needs_present`
/// is set, presentation as well. Graphics and present must share a family so
/// the swapchain can use exclusive sharing.
pub(crate) fn select_queue_family(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<u32> {
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics =
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        (graphics && supports_present(index)).then_some(index)
    })
}

pub(crate) fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    }
}

fn supports_swapchain(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) };
    let extensions = match extensions {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };
    let swapchain_name = ash::extensions::khr::Swapchain::name();
    extensions
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == swapchain_name)
}

fn select_physical_device(
    instance: &ash::Instance,
    target: Option<&PresentationTarget>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .in_subsystem(Subsystem::DeviceBootstrap, "vkEnumeratePhysicalDevices")?;
    info!("Found {} physical devices.", physical_devices.len());

    let mut best: Option<(u32, vk::PhysicalDevice, u32)> = None;
    let mut saw_swapchain_device = false;
    for pdevice in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        let device_name =
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();

        if target.is_some() && !supports_swapchain(instance, pdevice) {
            debug!("Device {} lacks VK_KHR_swapchain, skipping.", device_name);
            continue;
        }
        saw_swapchain_device = true;

        let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        let family = select_queue_family(&families, |index| match target {
            Some(target) => unsafe {
                target
                    .loader
                    .get_physical_device_surface_support(pdevice, index, target.surface)
                    .unwrap_or(false)
            },
            None => true,
        });
        let Some(family) = family else {
            debug!("Device {} has no graphics+present queue family, skipping.", device_name);
            continue;
        };

        let score = device_type_score(properties.device_type);
        debug!("Device {} scored {}.", device_name, score);
        if best.map_or(true, |(best_score, _, _)| score > best_score) {
            best = Some((score, pdevice, family));
        }
    }

    match best {
        Some((_, pdevice, family)) => Ok((pdevice, family)),
        None if saw_swapchain_device => Err(RendererError::NoSuitableQueueFamily),
        None => Err(RendererError::NoSuitableDevice),
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    with_swapchain: bool,
) -> Result<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities)
        .build()];

    let mut extension_names: Vec<*const c_char> = Vec::new();
    if with_swapchain {
        extension_names.push(ash::extensions::khr::Swapchain::name().as_ptr());
    }
    let features = vk::PhysicalDeviceFeatures::builder();

    let device_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_features(&features)
        .enabled_extension_names(&extension_names);

    let device = unsafe { instance.create_device(physical_device, &device_info, None) }
        .in_subsystem(Subsystem::DeviceBootstrap, "vkCreateDevice")?;
    info!("Logical device created.");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_must_offer_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        // family 1 has graphics but cannot present; family 2 can do both
        assert_eq!(select_queue_family(&families, |index| index == 2), Some(2));
        assert_eq!(select_queue_family(&families, |_| true), Some(1));
        assert_eq!(select_queue_family(&families, |index| index == 0), None);
    }

    #[test]
    fn discrete_gpus_outrank_integrated() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn headless_context_creation_and_drop() {
        crate::logging::init_logging(tracing::Level::DEBUG);
        match GpuContext::new_headless(&RendererConfig::default()) {
            Ok(ctx) => {
                info!("Headless GpuContext created for test.");
                assert!(ctx.presentation_target().is_none());
            }
            Err(e) => {
                warn!(
                    "Failed to create headless GpuContext in test \
                     (expected without a Vulkan driver): {:?}",
                    e
                );
            }
        }
    }
}
