//! # Fences
//!
//! Host-side completion tracking for one queue. A fence is armed with the
//! task count of the submission it was passed to and is signaled once the
//! submission boundary reports that task count as complete.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::{Error, Result, SubmissionBoundary, WaitStatus};

/// Completion state of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The tracked submission finished
    Signaled,
    /// Unarmed, or still executing
    NotReady,
}

/// Queue completion fence
#[derive(Debug)]
pub struct Fence {
    submitter: Arc<dyn SubmissionBoundary>,
    queue_id: u64,
    /// Task count waited for; zero while unarmed
    task_count: AtomicU64,
}

impl Fence {
    pub(crate) fn new(submitter: Arc<dyn SubmissionBoundary>, queue_id: u64) -> Self {
        Self {
            submitter,
            queue_id,
            task_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn arm(&self, task_count: u64) {
        self.task_count.store(task_count, Ordering::Release);
    }

    /// Queue the fence belongs to
    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// Task count the fence waits for, if armed
    pub fn task_count(&self) -> Option<u64> {
        match self.task_count.load(Ordering::Acquire) {
            0 => None,
            task => Some(task),
        }
    }

    fn poll(&self, timeout_ns: u64) -> Result<FenceStatus> {
        let Some(task) = self.task_count() else {
            return Ok(FenceStatus::NotReady);
        };
        match self.submitter.wait_for_task_count(task, timeout_ns) {
            WaitStatus::Ready => Ok(FenceStatus::Signaled),
            WaitStatus::NotReady => Ok(FenceStatus::NotReady),
            WaitStatus::GpuHang => {
                log::warn!("ember-queue: device lost while waiting on fence {}", task);
                Err(Error::DeviceLost)
            }
        }
    }

    /// Current status without blocking
    pub fn query_status(&self) -> Result<FenceStatus> {
        self.poll(0)
    }

    /// Wait up to `timeout_ns` for the fence
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<FenceStatus> {
        self.poll(timeout_ns)
    }

    /// Disarm
    pub fn reset(&self) {
        self.task_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSubmitter;

    #[test]
    fn test_unarmed_fence_is_not_ready() {
        let submitter: Arc<dyn SubmissionBoundary> = Arc::new(CaptureSubmitter::new());
        let fence = Fence::new(submitter, 1);
        assert_eq!(fence.task_count(), None);
        assert_eq!(fence.query_status(), Ok(FenceStatus::NotReady));
    }

    #[test]
    fn test_fence_follows_completion() {
        let capture = Arc::new(CaptureSubmitter::manual());
        let submitter: Arc<dyn SubmissionBoundary> = capture.clone();
        let fence = Fence::new(submitter, 1);
        fence.arm(3);
        assert_eq!(fence.query_status(), Ok(FenceStatus::NotReady));
        capture.complete_up_to(3);
        assert_eq!(fence.host_synchronize(1_000), Ok(FenceStatus::Signaled));
        fence.reset();
        assert_eq!(fence.query_status(), Ok(FenceStatus::NotReady));
    }

    #[test]
    fn test_hang_reports_device_lost() {
        let capture = Arc::new(CaptureSubmitter::new());
        let submitter: Arc<dyn SubmissionBoundary> = capture.clone();
        let fence = Fence::new(submitter, 1);
        fence.arm(1);
        capture.inject_hang();
        assert_eq!(fence.query_status(), Err(Error::DeviceLost));
    }
}
