// Vulkan instance, validation messenger and window surface
//
// Requests API 1.2 plus whatever window-system extensions the display needs.
// Validation is a request, not a requirement: a missing layer is logged and
// the program keeps going without it.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create the instance. Returns whether validation actually got enabled.
pub fn create_instance(
    entry: &Entry,
    app_name: &str,
    display_handle: RawDisplayHandle,
    enable_validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_name_cstr = CString::new(app_name)?;
    let engine_name = CString::new("No Engine")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .context("Failed to query window-system instance extensions")?
        .to_vec();

    let validation = enable_validation && validation_layer_available(entry)?;
    if enable_validation && !validation {
        log::warn!(
            "{} requested but not installed, continuing without validation",
            VALIDATION_LAYER.to_string_lossy()
        );
    }

    let layer_names = if validation {
        extensions.push(DebugUtils::name().as_ptr());
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    log::info!(
        "Created Vulkan 1.2 instance ({} extensions, validation {})",
        extensions.len(),
        if validation { "on" } else { "off" }
    );

    Ok((instance, validation))
}

fn validation_layer_available(entry: &Entry) -> Result<bool> {
    let layers = entry
        .enumerate_instance_layer_properties()
        .context("Failed to enumerate instance layers")?;

    Ok(layers
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
}

/// Validation messenger that forwards to `log`
pub struct DebugMessenger {
    loader: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(Self { loader, messenger })
    }

    pub fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

/// Presentation surface plus the loader needed to query and destroy it
pub struct Surface {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(entry, instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            surface,
        })
    }

    pub fn destroy(&self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
