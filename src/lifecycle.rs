// =============================================================================
// RESOURCE LIFECYCLE - creation ledger, ordered teardown, process state
// =============================================================================
//
// Every GPU object is recorded here the moment it is created. Teardown walks
// the ledger backwards, so destruction order is the exact reverse of creation
// no matter how far setup got before returning.

use anyhow::Result;
use thiserror::Error;

/// One entry per object (or object group) the context owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    Allocator,
    Swapchain,
    ImageViews,
    CommandPool,
    FrameSync,
    Image,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{0:?} was created twice")]
    AlreadyCreated(ResourceKind),
    #[error("Invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition { from: AppState, to: AppState },
}

/// Creation-ordered record of live resources
#[derive(Debug, Default)]
pub struct ResourceLedger {
    created: Vec<ResourceKind>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ResourceKind) -> Result<(), LifecycleError> {
        if self.created.contains(&kind) {
            return Err(LifecycleError::AlreadyCreated(kind));
        }
        log::debug!("Created {:?}", kind);
        self.created.push(kind);
        Ok(())
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.created.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    /// Live resources in the order they were created
    pub fn creation_order(&self) -> &[ResourceKind] {
        &self.created
    }

    /// Wait for the device to go idle, then destroy everything in reverse.
    ///
    /// The idle wait happens only when a device exists. A failed wait (device
    /// lost) is logged; destruction still proceeds since nothing can be in
    /// flight on a lost device. Each kind is handed out exactly once.
    pub fn teardown<D: ResourceDestroyer>(&mut self, destroyer: &mut D) {
        if self.created.is_empty() {
            return;
        }

        if self.contains(ResourceKind::Device) {
            if let Err(e) = destroyer.wait_idle() {
                log::warn!("Device idle wait failed before teardown: {:#}", e);
            }
        }

        while let Some(kind) = self.created.pop() {
            log::debug!("Destroying {:?}", kind);
            destroyer.destroy(kind);
        }
    }
}

/// Something that owns the handles named by a [`ResourceLedger`]
pub trait ResourceDestroyer {
    /// Block until no submitted GPU work remains
    fn wait_idle(&mut self) -> Result<()>;

    /// Release one resource. Only called once per kind, after `wait_idle`.
    fn destroy(&mut self, kind: ResourceKind);
}

/// Whole-process state machine.
///
/// `Uninitialized -> DeviceReady -> (Rendering)* -> Draining -> Terminated`.
/// Setup failure may jump straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Uninitialized,
    DeviceReady,
    Rendering,
    Draining,
    Terminated,
}

impl AppState {
    pub fn can_transition_to(self, next: AppState) -> bool {
        use AppState::*;
        matches!(
            (self, next),
            (Uninitialized, DeviceReady)
                | (Uninitialized, Draining)
                | (DeviceReady, Rendering)
                | (DeviceReady, Draining)
                | (Rendering, Rendering)
                | (Rendering, Draining)
                | (Draining, Terminated)
        )
    }

    pub fn transition(&mut self, next: AppState) -> Result<(), LifecycleError> {
        if !self.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition { from: *self, to: next });
        }
        if *self != next {
            log::info!("Lifecycle: {:?} -> {:?}", self, next);
        }
        *self = next;
        Ok(())
    }

    pub fn accepts_frames(self) -> bool {
        matches!(self, AppState::DeviceReady | AppState::Rendering)
    }
}
