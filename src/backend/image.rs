// Placeholder GPU image
//
// 1x1 R8_UINT, color-attachment + sampled, device-local through gpu-allocator.
// It is created at startup and destroyed at teardown; nothing ever touches it
// in between. Its allocation is what puts the allocator in the picture.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

pub const PLACEHOLDER_FORMAT: vk::Format = vk::Format::R8_UINT;

pub struct PlaceholderImage {
    pub image: vk::Image,
    allocation: Option<Allocation>,
}

impl PlaceholderImage {
    pub fn new(device: &ash::Device, allocator: &mut Allocator) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(PLACEHOLDER_FORMAT)
            .extent(vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }
            .context("Failed to create placeholder image")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: "placeholder image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e).context("Failed to allocate placeholder image memory");
            }
        };

        let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
        if let Err(e) = bound {
            unsafe { device.destroy_image(image, None) };
            if let Err(free_err) = allocator.free(allocation) {
                log::error!("Failed to free placeholder allocation: {}", free_err);
            }
            return Err(e).context("Failed to bind placeholder image memory");
        }

        log::info!(
            "Created 1x1 {:?} placeholder image ({} bytes device-local)",
            PLACEHOLDER_FORMAT,
            requirements.size
        );

        Ok(Self {
            image,
            allocation: Some(allocation),
        })
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe { device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free placeholder allocation: {}", e);
            }
        }
    }
}
