//! [`Fence`] and [`Semaphore`].
//!
//! Frame fences are created signaled so the first
//! [`wait_and_reset`](Fence::wait_and_reset) of a render loop returns at
//! once. Semaphores order acquire, render and present on the GPU.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error("Fence was marked submitted twice without a wait in between")]
    AlreadySubmitted,
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// Whether a wait on the fence can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceStatus {
    /// Signaled, or submitted and about to be.
    InFlight,
    /// Unsignaled and not part of any submission.
    Idle,
}

impl FenceStatus {
    fn mark_submitted(self) -> Result<Self, MarkSubmittedError> {
        match self {
            Self::Idle => Ok(Self::InFlight),
            Self::InFlight => Err(MarkSubmittedError::AlreadySubmitted),
        }
    }
}

/// An owned binary fence for CPU–GPU synchronisation.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    status: FenceStatus,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Fence {
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info has no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle is a valid fence created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            status: if signaled {
                FenceStatus::InFlight
            } else {
                FenceStatus::Idle
            },
        })
    }

    /// Block until the fence signals or `timeout_ns` elapses. Returns at
    /// once for an idle fence, which nothing will ever signal.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        if self.status == FenceStatus::Idle {
            return Ok(());
        }
        // SAFETY: handle is a valid fence created from parent.
        unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| {
            if e == vk::Result::TIMEOUT {
                WaitFenceError::Timeout
            } else {
                WaitFenceError::Vulkan(e)
            }
        })
    }

    /// Wait, then return the fence to the unsignaled idle state ready for
    /// the next submission.
    pub fn wait_and_reset(&mut self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        if self.status == FenceStatus::Idle {
            return Ok(());
        }
        self.wait(timeout_ns)?;
        // SAFETY: the wait succeeded so the fence is signaled and not
        // pending; &mut self keeps the handle from being resubmitted in
        // between.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
            .map_err(WaitFenceError::Vulkan)?;
        self.status = FenceStatus::Idle;
        Ok(())
    }

    /// Record that the fence was handed to a queue submission.
    ///
    /// # Safety
    /// The fence must really be part of a submission that will signal it.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        self.status = self.status.mark_submitted()?;
        Ok(())
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent; owners wait for the device
        // before teardown so no submission references it.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// An owned binary semaphore for GPU–GPU ordering.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: create_info has no borrowed pointers.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }
            .map_err(CreateSemaphoreError::Vulkan)?;

        // SAFETY: handle is a valid semaphore created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name semaphore {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: handle was created from parent; no queue operation waits on
        // or signals it once the owner has waited for the device.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_status_submit_cycle() {
        let status = FenceStatus::Idle.mark_submitted().expect("idle submits");
        assert_eq!(status, FenceStatus::InFlight);
        assert!(matches!(
            status.mark_submitted(),
            Err(MarkSubmittedError::AlreadySubmitted)
        ));
    }
}
