// =============================================================================
// FRAME SYNCHRONIZER - one fence, one command pool, strict frame serialization
// =============================================================================
//
// FRAME PROTOCOL (fixed order, every step fallible):
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ wait fence ─> reset fence ─> acquire ─> reset pool ─> allocate cmd       │
// │     ─> record barrier ─> submit (signals fence) ─> present               │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The fence wait is the only point that bounds reuse of command memory. It has
// no timeout: a stuck queue hangs the process, which is exactly what the
// reproduction wants to surface.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Swapchain is out of date and recreation is not supported")]
    SwapchainOutOfDate,
    #[error("Acquired image index {index} is outside the swapchain ({count} images)")]
    ImageIndexOutOfRange { index: u32, count: usize },
    #[error("Fence was reset by an earlier frame but never submitted, waiting would block forever")]
    FenceNeverSubmitted,
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::SwapchainOutOfDate,
            other => FrameError::Vulkan(other),
        }
    }
}

/// Result of a successful image acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// Summary of one presented frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub frame_number: u64,
    pub image_index: u32,
    pub suboptimal: bool,
}

/// GPU operations one frame is made of.
///
/// Implemented by the Vulkan context for real frames and by recording doubles
/// in tests. The synchronizer calls these in protocol order only.
pub trait FrameBackend {
    /// Block until the frame fence is signaled. No timeout.
    fn wait_for_fence(&mut self) -> Result<(), FrameError>;

    fn reset_fence(&mut self) -> Result<(), FrameError>;

    /// Next presentable image. No timeout.
    fn acquire_next_image(&mut self) -> Result<AcquiredImage, FrameError>;

    /// Length of both the swapchain image array and the view array
    fn image_count(&self) -> usize;

    /// Reset the whole pool, invalidating every buffer allocated from it
    fn reset_command_pool(&mut self) -> Result<(), FrameError>;

    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer, FrameError>;

    /// Record the single `UNDEFINED -> PRESENT_SRC_KHR` barrier
    fn record_present_transition(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<(), FrameError>;

    /// Submit `cmd` for the acquired image; completion signals the frame fence
    fn submit(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<(), FrameError>;

    /// Returns `true` when the swapchain reported itself suboptimal
    fn present(&mut self, image_index: u32) -> Result<bool, FrameError>;
}

/// CPU-side view of the frame fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Created signaled, nothing submitted yet
    Signaled,
    /// Reset, no submission has been made against it
    Reset,
    /// Submitted, GPU will signal it
    Submitted,
}

#[derive(Debug)]
pub struct FrameSynchronizer {
    fence: FenceState,
    frames_presented: u64,
    reported_suboptimal: bool,
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSynchronizer {
    /// Expects the backend fence to have been created signaled
    pub fn new() -> Self {
        Self {
            fence: FenceState::Signaled,
            frames_presented: 0,
            reported_suboptimal: false,
        }
    }

    pub fn fence_state(&self) -> FenceState {
        self.fence
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Run one frame. The first failing step aborts the rest of the frame.
    pub fn render_frame<B: FrameBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<PresentedFrame, FrameError> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait for the previous frame, then reset the fence
        // ─────────────────────────────────────────────────────────────────────
        if self.fence == FenceState::Reset {
            return Err(FrameError::FenceNeverSubmitted);
        }
        backend.wait_for_fence()?;
        backend.reset_fence()?;
        self.fence = FenceState::Reset;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire
        // ─────────────────────────────────────────────────────────────────────
        let acquired = backend.acquire_next_image()?;
        let count = backend.image_count();
        if acquired.index as usize >= count {
            return Err(FrameError::ImageIndexOutOfRange {
                index: acquired.index,
                count,
            });
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3 + 4: Fresh command buffer, one barrier
        // ─────────────────────────────────────────────────────────────────────
        backend.reset_command_pool()?;
        let cmd = backend.allocate_command_buffer()?;
        backend.record_present_transition(cmd, acquired.index)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Submit
        // ─────────────────────────────────────────────────────────────────────
        backend.submit(cmd, acquired.index)?;
        self.fence = FenceState::Submitted;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Present
        // ─────────────────────────────────────────────────────────────────────
        let present_suboptimal = backend.present(acquired.index)?;
        let suboptimal = acquired.suboptimal || present_suboptimal;
        if suboptimal && !self.reported_suboptimal {
            log::warn!("Swapchain is suboptimal for the surface, continuing without recreation");
            self.reported_suboptimal = true;
        }

        self.frames_presented += 1;

        Ok(PresentedFrame {
            frame_number: self.frames_presented,
            image_index: acquired.index,
            suboptimal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        WaitFence,
        ResetFence,
        Acquire,
        ResetPool,
        Allocate,
        Record(u32),
        Submit(u32),
        Present(u32),
    }

    /// Pretend GPU that finishes every submission immediately
    struct FakeGpu {
        calls: Vec<Call>,
        image_count: usize,
        fence_signaled: bool,
        pool_generation: u64,
        allocated_this_generation: u64,
        next_image: u32,
        scripted_acquires: VecDeque<Result<AcquiredImage, FrameError>>,
        scripted_presents: VecDeque<Result<bool, FrameError>>,
        fail_submit: Option<vk::Result>,
    }

    impl FakeGpu {
        fn new(image_count: usize) -> Self {
            Self {
                calls: Vec::new(),
                image_count,
                fence_signaled: true,
                pool_generation: 0,
                allocated_this_generation: 0,
                next_image: 0,
                scripted_acquires: VecDeque::new(),
                scripted_presents: VecDeque::new(),
                fail_submit: None,
            }
        }

        fn frame_calls(&self, frame: usize) -> &[Call] {
            &self.calls[frame * 8..(frame + 1) * 8]
        }
    }

    impl FrameBackend for FakeGpu {
        fn wait_for_fence(&mut self) -> Result<(), FrameError> {
            assert!(self.fence_signaled, "waited on a fence nothing will ever signal");
            self.calls.push(Call::WaitFence);
            Ok(())
        }

        fn reset_fence(&mut self) -> Result<(), FrameError> {
            assert!(self.fence_signaled, "reset an unsignaled fence");
            self.fence_signaled = false;
            self.calls.push(Call::ResetFence);
            Ok(())
        }

        fn acquire_next_image(&mut self) -> Result<AcquiredImage, FrameError> {
            self.calls.push(Call::Acquire);
            if let Some(scripted) = self.scripted_acquires.pop_front() {
                return scripted;
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(AcquiredImage {
                index,
                suboptimal: false,
            })
        }

        fn image_count(&self) -> usize {
            self.image_count
        }

        fn reset_command_pool(&mut self) -> Result<(), FrameError> {
            self.pool_generation += 1;
            self.allocated_this_generation = 0;
            self.calls.push(Call::ResetPool);
            Ok(())
        }

        fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer, FrameError> {
            self.allocated_this_generation += 1;
            self.calls.push(Call::Allocate);
            Ok(vk::CommandBuffer::from_raw(
                (self.pool_generation << 32) | self.allocated_this_generation,
            ))
        }

        fn record_present_transition(
            &mut self,
            _cmd: vk::CommandBuffer,
            image_index: u32,
        ) -> Result<(), FrameError> {
            self.calls.push(Call::Record(image_index));
            Ok(())
        }

        fn submit(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<(), FrameError> {
            if let Some(err) = self.fail_submit.take() {
                return Err(err.into());
            }
            assert_eq!(
                cmd.as_raw() >> 32,
                self.pool_generation,
                "submitted a command buffer from an earlier pool generation"
            );
            self.calls.push(Call::Submit(image_index));
            self.fence_signaled = true;
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<bool, FrameError> {
            self.calls.push(Call::Present(image_index));
            self.scripted_presents.pop_front().unwrap_or(Ok(false))
        }
    }

    #[test]
    fn every_frame_follows_protocol_order() {
        let mut gpu = FakeGpu::new(3);
        let mut sync = FrameSynchronizer::new();

        for _ in 0..5 {
            sync.render_frame(&mut gpu).unwrap();
        }

        assert_eq!(sync.frames_presented(), 5);
        for frame in 0..5 {
            let image = (frame % 3) as u32;
            assert_eq!(
                gpu.frame_calls(frame),
                &[
                    Call::WaitFence,
                    Call::ResetFence,
                    Call::Acquire,
                    Call::ResetPool,
                    Call::Allocate,
                    Call::Record(image),
                    Call::Submit(image),
                    Call::Present(image),
                ]
            );
        }
    }

    #[test]
    fn fence_is_waited_exactly_once_per_reset() {
        let mut gpu = FakeGpu::new(2);
        let mut sync = FrameSynchronizer::new();

        for _ in 0..10 {
            sync.render_frame(&mut gpu).unwrap();
        }

        let waits = gpu.calls.iter().filter(|c| **c == Call::WaitFence).count();
        let resets = gpu.calls.iter().filter(|c| **c == Call::ResetFence).count();
        let submits = gpu.calls.iter().filter(|c| matches!(c, Call::Submit(_))).count();
        assert_eq!((waits, resets, submits), (10, 10, 10));
        assert_eq!(sync.fence_state(), FenceState::Submitted);
    }

    #[test]
    fn initially_signaled_fence_does_not_block() {
        let mut gpu = FakeGpu::new(2);
        let mut sync = FrameSynchronizer::new();
        assert_eq!(sync.fence_state(), FenceState::Signaled);

        let frame = sync.render_frame(&mut gpu).unwrap();

        assert_eq!(frame.frame_number, 1);
        assert_eq!(gpu.calls.first(), Some(&Call::WaitFence));
    }

    #[test]
    fn out_of_date_acquire_is_reported_and_nothing_is_submitted() {
        let mut gpu = FakeGpu::new(2);
        gpu.scripted_acquires
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR.into()));
        let mut sync = FrameSynchronizer::new();

        let err = sync.render_frame(&mut gpu).unwrap_err();

        assert_eq!(err, FrameError::SwapchainOutOfDate);
        assert_eq!(
            gpu.calls,
            vec![Call::WaitFence, Call::ResetFence, Call::Acquire]
        );
        assert_eq!(sync.frames_presented(), 0);
    }

    #[test]
    fn stale_fence_is_refused_instead_of_hanging() {
        let mut gpu = FakeGpu::new(2);
        gpu.scripted_acquires
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR.into()));
        let mut sync = FrameSynchronizer::new();

        assert!(sync.render_frame(&mut gpu).is_err());
        assert_eq!(sync.fence_state(), FenceState::Reset);

        let calls_before = gpu.calls.len();
        assert_eq!(
            sync.render_frame(&mut gpu).unwrap_err(),
            FrameError::FenceNeverSubmitted
        );
        assert_eq!(gpu.calls.len(), calls_before);
    }

    #[test]
    fn out_of_range_index_is_rejected_before_recording() {
        let mut gpu = FakeGpu::new(2);
        gpu.scripted_acquires.push_back(Ok(AcquiredImage {
            index: 2,
            suboptimal: false,
        }));
        let mut sync = FrameSynchronizer::new();

        let err = sync.render_frame(&mut gpu).unwrap_err();

        assert_eq!(err, FrameError::ImageIndexOutOfRange { index: 2, count: 2 });
        assert!(!gpu.calls.iter().any(|c| matches!(c, Call::Record(_))));
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let mut gpu = FakeGpu::new(3);
        gpu.scripted_acquires.push_back(Ok(AcquiredImage {
            index: 1,
            suboptimal: true,
        }));
        let mut sync = FrameSynchronizer::new();

        let frame = sync.render_frame(&mut gpu).unwrap();

        assert!(frame.suboptimal);
        assert_eq!(gpu.calls.last(), Some(&Call::Present(1)));
    }

    #[test]
    fn failed_submit_surfaces_vulkan_error() {
        let mut gpu = FakeGpu::new(2);
        gpu.fail_submit = Some(vk::Result::ERROR_DEVICE_LOST);
        let mut sync = FrameSynchronizer::new();

        assert_eq!(
            sync.render_frame(&mut gpu).unwrap_err(),
            FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        );
        assert!(!gpu.calls.iter().any(|c| matches!(c, Call::Present(_))));
    }

    #[test]
    fn out_of_date_present_leaves_fence_waitable() {
        let mut gpu = FakeGpu::new(2);
        gpu.scripted_presents
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR.into()));
        let mut sync = FrameSynchronizer::new();

        let err = sync.render_frame(&mut gpu).unwrap_err();

        assert_eq!(err, FrameError::SwapchainOutOfDate);
        assert_eq!(sync.fence_state(), FenceState::Submitted);
        assert_eq!(sync.frames_presented(), 0);

        // the submission went through, so the next frame can wait on its fence
        let frame = sync.render_frame(&mut gpu).unwrap();
        assert_eq!(frame.frame_number, 1);
    }

    #[test]
    fn suboptimal_present_is_reported_and_rendering_continues() {
        let mut gpu = FakeGpu::new(3);
        gpu.scripted_presents.push_back(Ok(true));
        let mut sync = FrameSynchronizer::new();

        let first = sync.render_frame(&mut gpu).unwrap();
        let second = sync.render_frame(&mut gpu).unwrap();

        assert!(first.suboptimal);
        assert!(!second.suboptimal);
        assert_eq!(sync.frames_presented(), 2);
    }

    #[test]
    fn suboptimal_warning_is_latched_after_first_frame() {
        let mut gpu = FakeGpu::new(3);
        gpu.scripted_presents.push_back(Ok(true));
        gpu.scripted_presents.push_back(Ok(true));
        let mut sync = FrameSynchronizer::new();
        assert!(!sync.reported_suboptimal);

        assert!(sync.render_frame(&mut gpu).unwrap().suboptimal);
        assert!(sync.reported_suboptimal);
        assert!(sync.render_frame(&mut gpu).unwrap().suboptimal);
        assert!(sync.reported_suboptimal);
        assert_eq!(sync.frames_presented(), 2);
    }

    #[test]
    fn submit_and_present_use_the_acquired_image() {
        let mut gpu = FakeGpu::new(3);
        gpu.scripted_acquires.push_back(Ok(AcquiredImage {
            index: 2,
            suboptimal: false,
        }));
        let mut sync = FrameSynchronizer::new();

        let frame = sync.render_frame(&mut gpu).unwrap();

        assert_eq!(frame.image_index, 2);
        assert_eq!(&gpu.calls[5..], &[Call::Record(2), Call::Submit(2), Call::Present(2)]);
    }
}
