// Vulkan Device - physical device selection, logical device, allocator
//
// Requirements for a usable GPU:
// - Vulkan 1.2 or newer
// - VK_KHR_swapchain
// - buffer device address, including capture replay (what the debugging tool
//   relies on, and what the reproduction exercises)
// - one queue family that does both graphics and present

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::ffi::CStr;
use thiserror::Error;

use super::Surface;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceSelectionError {
    #[error("No Vulkan-capable GPU found")]
    NoDevices,
    #[error(
        "No GPU meets the requirements (Vulkan 1.2, VK_KHR_swapchain, buffer device \
         address with capture replay, a graphics+present queue family)"
    )]
    NoSuitableDevice,
}

/// Queue family properties that matter for selection
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub supports_present: bool,
}

/// Everything selection needs to know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub has_swapchain_extension: bool,
    pub buffer_device_address: bool,
    pub buffer_device_address_capture_replay: bool,
    pub queue_families: Vec<QueueFamilyInfo>,
}

impl DeviceCandidate {
    /// First queue family that supports both graphics and present
    pub fn graphics_present_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .position(|family| {
                family.flags.contains(vk::QueueFlags::GRAPHICS) && family.supports_present
            })
            .map(|i| i as u32)
    }

    /// Why this device can't be used, if it can't
    pub fn rejection(&self) -> Option<&'static str> {
        if self.api_version < vk::API_VERSION_1_2 {
            return Some("Vulkan version below 1.2");
        }
        if !self.has_swapchain_extension {
            return Some("missing VK_KHR_swapchain");
        }
        if !self.buffer_device_address {
            return Some("no buffer device address");
        }
        if !self.buffer_device_address_capture_replay {
            return Some("no buffer device address capture replay");
        }
        if self.graphics_present_family().is_none() {
            return Some("no queue family with graphics and present");
        }
        None
    }

    /// Higher is better, `None` when unusable. Discrete beats integrated.
    pub fn score(&self) -> Option<u32> {
        if self.rejection().is_some() {
            return None;
        }
        Some(match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        })
    }
}

/// Index of the best usable candidate. Ties go to the earlier device.
pub fn select_candidate(candidates: &[DeviceCandidate]) -> Result<usize, DeviceSelectionError> {
    if candidates.is_empty() {
        return Err(DeviceSelectionError::NoDevices);
    }

    let mut best: Option<(usize, u32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        match candidate.score() {
            Some(score) if best.map_or(true, |(_, best_score)| score > best_score) => {
                best = Some((i, score));
            }
            Some(_) => {}
            None => {
                log::info!(
                    "Skipping GPU {}: {}",
                    candidate.name,
                    candidate.rejection().unwrap_or("unknown")
                );
            }
        }
    }

    best.map(|(i, _)| i)
        .ok_or(DeviceSelectionError::NoSuitableDevice)
}

/// Logical device plus the single queue used for both submit and present
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family: u32,
}

impl VulkanDevice {
    pub fn new(instance: &ash::Instance, surface: &Surface) -> Result<Self> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let candidates = physical_devices
            .iter()
            .map(|&pd| describe_device(instance, pd, surface))
            .collect::<Result<Vec<_>>>()?;

        let chosen = select_candidate(&candidates)?;
        let physical_device = physical_devices[chosen];
        let candidate = &candidates[chosen];
        let queue_family = candidate
            .graphics_present_family()
            .context("Selected GPU lost its graphics+present queue family")?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {}", candidate.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Graphics/present queue family: {}", queue_family);

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let mut buffer_device_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::builder()
            .buffer_device_address(true)
            .buffer_device_address_capture_replay(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut buffer_device_address);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok(Self {
            device,
            physical_device,
            queue,
            queue_family,
        })
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }

    pub fn destroy(&self) {
        unsafe {
            self.device.destroy_device(None);
        }
    }

    pub fn create_allocator(&self, instance: &ash::Instance) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: self.device.clone(),
            physical_device: self.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }
}

fn describe_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: &Surface,
) -> Result<DeviceCandidate> {
    let props = unsafe { instance.get_physical_device_properties(physical_device) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .with_context(|| format!("Failed to enumerate extensions of {}", name))?;
    let has_swapchain_extension = extensions.iter().any(|ext| {
        (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == khr::Swapchain::name()
    });

    // vkGetPhysicalDeviceFeatures2 is only valid on 1.1+ devices
    let supports_1_2 = props.api_version >= vk::API_VERSION_1_2;
    let (bda, bda_capture_replay) = if supports_1_2 {
        let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut features2 =
            vk::PhysicalDeviceFeatures2::builder().push_next(&mut bda_features);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        (
            bda_features.buffer_device_address == vk::TRUE,
            bda_features.buffer_device_address_capture_replay == vk::TRUE,
        )
    } else {
        (false, false)
    };

    let queue_families = unsafe {
        instance.get_physical_device_queue_family_properties(physical_device)
    }
    .iter()
    .enumerate()
    .map(|(i, family)| {
        let supports_present = unsafe {
            surface.loader.get_physical_device_surface_support(
                physical_device,
                i as u32,
                surface.surface,
            )
        }
        .with_context(|| format!("Failed to query present support of {}", name))?;
        Ok(QueueFamilyInfo {
            flags: family.queue_flags,
            supports_present,
        })
    })
    .collect::<Result<Vec<_>>>()?;

    Ok(DeviceCandidate {
        name,
        device_type: props.device_type,
        api_version: props.api_version,
        has_swapchain_extension,
        buffer_device_address: bda,
        buffer_device_address_capture_replay: bda_capture_replay,
        queue_families,
    })
}
