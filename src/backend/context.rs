// GPU context - the one owner of every Vulkan object
//
// Setup records each object in a ResourceLedger as soon as it exists. If any
// step fails, dropping the half-built context tears down exactly what was
// created, in reverse. The frame loop borrows a FrameResources view.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::Allocator;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use super::instance::{self, DebugMessenger, Surface};
use super::{FrameSync, PlaceholderImage, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::frame::{AcquiredImage, FrameBackend, FrameError};
use crate::lifecycle::{ResourceDestroyer, ResourceKind, ResourceLedger};

pub struct GpuContext {
    ledger: ResourceLedger,
    explicit_semaphores: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Handles, in creation order. `None` until created and after destroyed.
    // ─────────────────────────────────────────────────────────────────────────
    instance: Option<ash::Instance>,
    debug_messenger: Option<DebugMessenger>,
    surface: Option<Surface>,
    device: Option<VulkanDevice>,
    allocator: Option<Allocator>,
    swapchain: Option<Swapchain>,
    command_pool: Option<vk::CommandPool>,
    frame_sync: Option<FrameSync>,
    image: Option<PlaceholderImage>,

    // Loader outlives every handle above
    entry: Entry,
}

impl GpuContext {
    /// Run the whole setup sequence against `window`.
    ///
    /// Order: instance -> debug messenger -> surface -> device -> allocator ->
    /// swapchain -> image views -> command pool -> frame sync -> image.
    pub fn new<W>(window: &W, width: u32, height: u32, config: &Config) -> Result<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Initializing Vulkan...");

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let mut ctx = Self {
            ledger: ResourceLedger::new(),
            explicit_semaphores: config.sync.explicit_semaphores,
            instance: None,
            debug_messenger: None,
            surface: None,
            device: None,
            allocator: None,
            swapchain: None,
            command_pool: None,
            frame_sync: None,
            image: None,
            entry,
        };

        // Early returns drop `ctx`, which tears down whatever got created
        ctx.init(window, width, height, config)?;

        if !ctx.explicit_semaphores {
            log::warn!("Explicit semaphores disabled: acquire/submit/present are unordered");
        }
        log::info!("Vulkan initialized successfully!");
        Ok(ctx)
    }

    fn init<W>(&mut self, window: &W, width: u32, height: u32, config: &Config) -> Result<()>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        // STEP 1: Instance (+ validation messenger)
        let (instance, validation) = instance::create_instance(
            &self.entry,
            &config.window.title,
            display_handle,
            config.debug.validation_layers,
        )?;
        self.instance = Some(instance);
        self.ledger.record(ResourceKind::Instance)?;
        let instance = self.instance.as_ref().context("Instance not initialized")?;

        if validation {
            self.debug_messenger = Some(DebugMessenger::new(&self.entry, instance)?);
            self.ledger.record(ResourceKind::DebugMessenger)?;
        }

        // STEP 2: Surface
        self.surface = Some(Surface::new(&self.entry, instance, display_handle, window_handle)?);
        self.ledger.record(ResourceKind::Surface)?;
        let surface = self.surface.as_ref().context("Surface not initialized")?;

        // STEP 3: Device + graphics/present queue
        self.device = Some(VulkanDevice::new(instance, surface)?);
        self.ledger.record(ResourceKind::Device)?;
        let device = self.device.as_ref().context("Device not initialized")?;

        // STEP 4: Allocator
        self.allocator = Some(device.create_allocator(instance)?);
        self.ledger.record(ResourceKind::Allocator)?;

        // STEP 5: Swapchain, then its views
        self.swapchain = Some(Swapchain::new(instance, device, surface, width, height)?);
        self.ledger.record(ResourceKind::Swapchain)?;
        let swapchain = self.swapchain.as_mut().context("Swapchain not initialized")?;
        swapchain.create_image_views(&device.device)?;
        self.ledger.record(ResourceKind::ImageViews)?;
        let image_count = swapchain.image_count();

        // STEP 6: Transient command pool on the graphics family
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        self.command_pool = Some(command_pool);
        self.ledger.record(ResourceKind::CommandPool)?;

        // STEP 7: Fence (signaled) + semaphores, render-finished per image
        self.frame_sync = Some(FrameSync::new(&device.device, image_count)?);
        self.ledger.record(ResourceKind::FrameSync)?;

        // STEP 8: The throwaway image
        let allocator = self.allocator.as_mut().context("Allocator not initialized")?;
        self.image = Some(PlaceholderImage::new(&device.device, allocator)?);
        self.ledger.record(ResourceKind::Image)?;

        Ok(())
    }

    /// Borrow what one frame needs
    pub fn frame_resources(&self) -> Result<FrameResources<'_>> {
        Ok(FrameResources {
            device: self.device.as_ref().context("Device not initialized")?,
            swapchain: self.swapchain.as_ref().context("Swapchain not initialized")?,
            command_pool: self.command_pool.context("Command pool not initialized")?,
            sync: self.frame_sync.as_ref().context("Frame sync not initialized")?,
            explicit_semaphores: self.explicit_semaphores,
        })
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|swapchain| swapchain.extent)
    }

    /// Resources still alive, in creation order
    pub fn live_resources(&self) -> &[ResourceKind] {
        self.ledger.creation_order()
    }

    /// Device-idle wait, then reverse-order destruction. Safe to call twice.
    pub fn teardown(&mut self) {
        if self.ledger.is_empty() {
            return;
        }
        log::info!("Cleaning up {} Vulkan resources...", self.ledger.len());
        let mut ledger = std::mem::take(&mut self.ledger);
        ledger.teardown(self);
        log::info!("Cleanup complete");
    }
}

impl ResourceDestroyer for GpuContext {
    fn wait_idle(&mut self) -> Result<()> {
        match self.device.as_ref() {
            Some(device) => device.wait_idle(),
            None => Ok(()),
        }
    }

    fn destroy(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::Image => {
                if let (Some(mut image), Some(device), Some(allocator)) =
                    (self.image.take(), self.device.as_ref(), self.allocator.as_mut())
                {
                    image.destroy(&device.device, allocator);
                }
            }
            ResourceKind::FrameSync => {
                if let (Some(sync), Some(device)) = (self.frame_sync.take(), self.device.as_ref()) {
                    sync.destroy(&device.device);
                }
            }
            ResourceKind::CommandPool => {
                if let (Some(pool), Some(device)) = (self.command_pool.take(), self.device.as_ref()) {
                    // Frees every command buffer allocated from it
                    unsafe { device.device.destroy_command_pool(pool, None) };
                }
            }
            ResourceKind::ImageViews => {
                if let (Some(swapchain), Some(device)) =
                    (self.swapchain.as_mut(), self.device.as_ref())
                {
                    swapchain.destroy_image_views(&device.device);
                }
            }
            ResourceKind::Swapchain => {
                if let Some(swapchain) = self.swapchain.take() {
                    swapchain.destroy();
                }
            }
            ResourceKind::Allocator => {
                // Dropping the allocator returns its memory blocks to the device
                drop(self.allocator.take());
            }
            ResourceKind::Device => {
                if let Some(device) = self.device.take() {
                    device.destroy();
                }
            }
            ResourceKind::Surface => {
                if let Some(surface) = self.surface.take() {
                    surface.destroy();
                }
            }
            ResourceKind::DebugMessenger => {
                if let Some(messenger) = self.debug_messenger.take() {
                    messenger.destroy();
                }
            }
            ResourceKind::Instance => {
                if let Some(instance) = self.instance.take() {
                    unsafe { instance.destroy_instance(None) };
                }
            }
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Borrowed view of the objects one frame touches
pub struct FrameResources<'a> {
    device: &'a VulkanDevice,
    swapchain: &'a Swapchain,
    command_pool: vk::CommandPool,
    sync: &'a FrameSync,
    explicit_semaphores: bool,
}

impl FrameResources<'_> {
    fn acquire_semaphore(&self) -> vk::Semaphore {
        if self.explicit_semaphores {
            self.sync.image_available
        } else {
            vk::Semaphore::null()
        }
    }

    fn render_finished(&self, image_index: u32) -> Result<vk::Semaphore, FrameError> {
        self.sync
            .render_finished_for(image_index)
            .ok_or(FrameError::ImageIndexOutOfRange {
                index: image_index,
                count: self.sync.render_finished.len(),
            })
    }
}

impl FrameBackend for FrameResources<'_> {
    fn wait_for_fence(&mut self) -> Result<(), FrameError> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.sync.in_flight_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    fn reset_fence(&mut self) -> Result<(), FrameError> {
        unsafe { self.device.device.reset_fences(&[self.sync.in_flight_fence])? };
        Ok(())
    }

    fn acquire_next_image(&mut self) -> Result<AcquiredImage, FrameError> {
        let (index, suboptimal) = self
            .swapchain
            .acquire_next_image(self.acquire_semaphore())?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn image_count(&self) -> usize {
        debug_assert_eq!(self.swapchain.images.len(), self.swapchain.image_views.len());
        self.swapchain.image_count()
    }

    fn reset_command_pool(&mut self) -> Result<(), FrameError> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer, FrameError> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .first()
            .copied()
            .ok_or(FrameError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn record_present_transition(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<(), FrameError> {
        let device = &self.device.device;
        let image = self.swapchain.images[image_index as usize];

        // With an acquire semaphore the submit waits at COLOR_ATTACHMENT_OUTPUT,
        // so the barrier has to start there to chain onto that wait.
        let src_stage = if self.explicit_semaphores {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        } else {
            vk::PipelineStageFlags::TOP_OF_PIPE
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(super::swapchain::color_subresource_range())
            .build();

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
            device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    fn submit(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<(), FrameError> {
        let command_buffers = [cmd];
        let wait_semaphores = [self.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished(image_index)?];

        let mut submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        if self.explicit_semaphores {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal_semaphores);
        }

        unsafe {
            self.device.device.queue_submit(
                self.device.queue,
                &[submit_info.build()],
                self.sync.in_flight_fence,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<bool, FrameError> {
        let render_finished = [self.render_finished(image_index)?];
        let wait: &[vk::Semaphore] = if self.explicit_semaphores {
            &render_finished
        } else {
            &[]
        };
        Ok(self.swapchain.present(self.device.queue, image_index, wait)?)
    }
}
