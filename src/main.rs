// =============================================================================
// RENDERDOC BUG REPRODUCTION
// =============================================================================
//
// Opens a fixed 640x480 window, builds the smallest Vulkan setup that still
// involves an allocator-backed image, and presents swapchain images that only
// ever receive a single layout-transition barrier.
//
// PROCESS LIFECYCLE:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Uninitialized ─> DeviceReady ─> Rendering ⟲ ─> Draining        │
// │                                                    └─> Terminated│
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (see frame.rs):
// 1. Wait for + reset the single fence
// 2. Acquire swapchain image
// 3. Reset pool, allocate one command buffer
// 4. Record UNDEFINED -> PRESENT_SRC barrier
// 5. Submit, signaling the fence
// 6. Present
//
// =============================================================================

mod backend;
mod config;
mod frame;
mod lifecycle;

use anyhow::Result;
use backend::GpuContext;
use config::Config;
use frame::FrameSynchronizer;
use lifecycle::AppState;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, load_outcome) = Config::load();

    init_logging(&config);
    load_outcome.log();
    log::debug!("Config: {:?}", config);
    log::info!("Starting RenderDoc bug reproduction");
    log::info!(
        "Window: {}x{}, explicit semaphores: {}",
        config.window.width,
        config.window.height,
        config.sync.explicit_semaphores
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    let run_result = event_loop.run_app(&mut app);

    // Tear down even when the event loop itself failed
    let shutdown_result = app.shutdown();
    run_result?;
    shutdown_result
}

/// `debug.log_level` from the config, overridable with RUST_LOG
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the GPU context (and its surface) must go
/// before the window it was created from.
struct App {
    config: Config,
    state: AppState,
    gpu: Option<GpuContext>,
    window: Option<Arc<Window>>,
    synchronizer: FrameSynchronizer,
    /// First fatal error, returned from `main` after teardown
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            state: AppState::Uninitialized,
            gpu: None,
            window: None,
            synchronizer: FrameSynchronizer::default(),
            failure: None,
        }
    }

    /// Stop producing frames and leave the event loop
    fn begin_shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.can_transition_to(AppState::Draining) {
            if let Err(e) = self.state.transition(AppState::Draining) {
                log::error!("{}", e);
            }
        }
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        self.begin_shutdown(event_loop);
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        if !self.state.accepts_frames() {
            return;
        }
        let Some(gpu) = self.gpu.as_ref() else {
            return;
        };

        let result = gpu.frame_resources().and_then(|mut frame| {
            self.synchronizer
                .render_frame(&mut frame)
                .map_err(anyhow::Error::from)
        });

        match result {
            Ok(frame) => {
                log::trace!(
                    "Presented frame {} (image {}{})",
                    frame.frame_number,
                    frame.image_index,
                    if frame.suboptimal { ", suboptimal" } else { "" }
                );
                if let Err(e) = self.state.transition(AppState::Rendering) {
                    self.fail(event_loop, e.into());
                    return;
                }
                if frame_limit_reached(self.config.debug.max_frames, frame.frame_number) {
                    log::info!("Reached {} frames, closing", frame.frame_number);
                    self.begin_shutdown(event_loop);
                }
            }
            Err(e) => self.fail(event_loop, e.context("Frame failed")),
        }
    }

    /// Drain and destroy. Runs once, after the event loop has returned.
    fn shutdown(&mut self) -> Result<()> {
        if self.state.can_transition_to(AppState::Draining) {
            self.state.transition(AppState::Draining)?;
        }

        if let Some(mut gpu) = self.gpu.take() {
            gpu.teardown();
        }
        self.window = None;
        self.state.transition(AppState::Terminated)?;

        log::info!("Presented {} frames", self.synchronizer.frames_presented());
        log::debug!("Final fence state: {:?}", self.synchronizer.fence_state());

        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Whether `frames_presented` has hit the configured `debug.max_frames`
fn frame_limit_reached(max_frames: Option<u64>, frames_presented: u64) -> bool {
    max_frames.is_some_and(|max| frames_presented >= max)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.state != AppState::Uninitialized {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        let size = window.inner_size();
        let gpu = match GpuContext::new(&*window, size.width, size.height, &self.config) {
            Ok(gpu) => gpu,
            Err(e) => {
                self.window = Some(window);
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        };

        if let Some(extent) = gpu.swapchain_extent() {
            log::info!("Presenting at {}x{}", extent.width, extent.height);
        }
        log::debug!("Live resources: {:?}", gpu.live_resources());

        self.gpu = Some(gpu);
        self.window = Some(window);
        if let Err(e) = self.state.transition(AppState::DeviceReady) {
            self.fail(event_loop, e.into());
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.begin_shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => self.render(event_loop),
            _ => {}
        }
    }

    /// Keep frames coming; the close signal is only seen between frames
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if !self.state.accepts_frames() {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
