// Synchronization primitives
//
// One fence for CPU-GPU frame serialization. One image-available semaphore for
// acquire -> submit, and one render-finished semaphore per swapchain image for
// submit -> present. A render-finished semaphore can only be signaled again
// once its image has been re-acquired, which means its previous present wait
// has been consumed. The fence alone does not guarantee that.

use anyhow::{Context, Result};
use ash::vk;

/// The single set of sync objects; there is only ever one frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    /// Indexed by swapchain image
    pub render_finished: Vec<vk::Semaphore>,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device, image_count: usize) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // first wait returns at once

        let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }
            .context("Failed to create frame fence")?;

        // Fill in as we go so a failure part way can destroy what exists
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: Vec::with_capacity(image_count),
            in_flight_fence,
        };

        match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => sync.image_available = semaphore,
            Err(e) => {
                sync.destroy(device);
                return Err(e).context("Failed to create image-available semaphore");
            }
        }

        for i in 0..image_count {
            match unsafe { device.create_semaphore(&semaphore_info, None) } {
                Ok(semaphore) => sync.render_finished.push(semaphore),
                Err(e) => {
                    sync.destroy(device);
                    return Err(e)
                        .with_context(|| format!("Failed to create render-finished semaphore {}", i));
                }
            }
        }

        log::debug!("Created frame fence and {} render-finished semaphores", image_count);
        Ok(sync)
    }

    /// Semaphore the submit for `image_index` signals and its present waits on
    pub fn render_finished_for(&self, image_index: u32) -> Option<vk::Semaphore> {
        self.render_finished.get(image_index as usize).copied()
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            for &semaphore in &self.render_finished {
                device.destroy_semaphore(semaphore, None);
            }
            if self.image_available != vk::Semaphore::null() {
                device.destroy_semaphore(self.image_available, None);
            }
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
