//! Instance creation and device selection.

use crate::error::{GfxError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};
use tracing::{debug, error, info, trace, warn};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Bytes of push constants every accepted device offers.
pub const REQUIRED_PUSH_CONSTANTS: u32 = tinker_core::limits::MIN_PUSH_CONSTANTS_SIZE;

/// Instance plus the optional debug messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

/// Create a Vulkan 1.3 instance. Surface extensions are enabled only when a
/// display is given.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<InstanceBundle> {
    let app_name = CString::new(app_name).map_err(|e| GfxError::Other(e.to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Tinker")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extension_names: Vec<*const i8> = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)
            .map_err(|e| GfxError::SurfaceCreation(e.to_string()))?
            .to_vec(),
        None => Vec::new(),
    };

    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let has_validation = available_layers.iter().any(|props| {
        props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER)
    });
    let validation = enable_validation && has_validation;
    if enable_validation && !has_validation {
        warn!("Validation layer {VALIDATION_LAYER:?} not available");
    }
    if validation {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layer_names: Vec<*const i8> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    let debug_utils = if validation {
        let loader = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
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
            .pfn_user_callback(Some(debug_callback));
        let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_info, None)? };
        debug!("Validation enabled");
        Some((loader, messenger))
    } else {
        None
    };

    Ok(InstanceBundle {
        instance,
        debug_utils,
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback struct for the call.
    let message = unsafe { (*data).message_as_c_str() }
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {message}");
    } else {
        trace!("[vulkan] {message}");
    }
    vk::FALSE
}

/// A device that passed the requirement checks.
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,
}

/// Pick the best device offering Vulkan 1.3 with dynamic rendering,
/// runtime descriptor arrays and enough push constants.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(i32, SelectedDevice)> = None;
    for device in devices {
        let Some(selected) = (unsafe { check_device(instance, device) }) else {
            continue;
        };
        let score = unsafe { score_physical_device(instance, &selected) };
        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((score, selected));
        }
    }

    let (_, selected) = best.ok_or(GfxError::NoSuitableDevice)?;
    let name = selected
        .properties
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default();
    info!("Selected GPU: {name} ({:?})", selected.properties.device_type);
    Ok(selected)
}

unsafe fn check_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<SelectedDevice> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    if vk::api_version_major(properties.api_version) == 1
        && vk::api_version_minor(properties.api_version) < 3
    {
        debug!("Skipping {name}: Vulkan 1.3 not supported");
        return None;
    }
    if properties.limits.max_push_constants_size < REQUIRED_PUSH_CONSTANTS {
        debug!("Skipping {name}: {} bytes of push constants", properties.limits.max_push_constants_size);
        return None;
    }

    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features13)
        .push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    if features13.dynamic_rendering != vk::TRUE || features13.synchronization2 != vk::TRUE {
        debug!("Skipping {name}: dynamic rendering unavailable");
        return None;
    }
    if features12.runtime_descriptor_array != vk::TRUE
        || features12.descriptor_binding_partially_bound != vk::TRUE
    {
        debug!("Skipping {name}: runtime descriptor arrays unavailable");
        return None;
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_family = families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && family.timestamp_valid_bits > 0
        })? as u32;

    Some(SelectedDevice {
        physical_device: device,
        queue_family,
        properties,
    })
}

unsafe fn score_physical_device(instance: &ash::Instance, selected: &SelectedDevice) -> i32 {
    let mut score = match selected.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    let memory = unsafe { instance.get_physical_device_memory_properties(selected.physical_device) };
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32;
    score
}

/// Create the logical device with one graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .shader_sampled_image_array_non_uniform_indexing(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe {
        instance
            .create_device(selected.physical_device, &device_create_info, None)
            .map_err(|e| GfxError::ExtensionNotSupported(e.to_string()))?
    };
    let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };
    Ok((device, queue))
}

/// Index of a memory type allowed by `type_bits` with all of `flags`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
    })
}
