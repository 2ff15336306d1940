//! # Capture Submission Boundary
//!
//! A [`SubmissionBoundary`] that records every batch instead of handing it
//! to an OS. Completion is simulated: by default every batch completes as
//! soon as it is submitted, a manual submitter completes only what
//! [`CaptureSubmitter::complete_up_to`] releases, and an injected hang makes
//! every later wait report [`WaitStatus::GpuHang`].

use alloc::vec::Vec;

use spin::Mutex;

use ember_core::{
    AllocationId, BatchBufferDescriptor, Error, GpuAddr, Result, SubmissionBoundary, SubmitFlags,
    TileMask, WaitStatus,
};

/// One recorded submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBatch {
    /// Copy of the batch bytes
    pub commands: Vec<u8>,
    /// Start address
    pub gpu_start: GpuAddr,
    /// Used size
    pub used_size: usize,
    /// Residency list handed over with the batch
    pub residency: Vec<AllocationId>,
    /// Flags
    pub flags: SubmitFlags,
    /// Task count the batch signals
    pub task_count: u64,
    /// Executing tiles
    pub tile_mask: TileMask,
}

#[derive(Debug, Default)]
struct CaptureState {
    batches: Vec<CapturedBatch>,
    completed: u64,
    hung: bool,
    manual: bool,
    reject_next: bool,
}

/// Recording submission boundary
#[derive(Debug, Default)]
pub struct CaptureSubmitter {
    state: Mutex<CaptureState>,
}

impl CaptureSubmitter {
    /// Submitter completing every batch immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Submitter completing batches only when told to
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(CaptureState {
                manual: true,
                ..Default::default()
            }),
        }
    }

    /// Complete every batch up to `task_count`
    pub fn complete_up_to(&self, task_count: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(task_count);
    }

    /// Make the device hang; later waits report a hang
    pub fn inject_hang(&self) {
        log::warn!("ember-queue: capture submitter simulating a GPU hang");
        self.state.lock().hung = true;
    }

    /// Reject the next submission
    pub fn reject_next(&self) {
        self.state.lock().reject_next = true;
    }

    /// Recorded batches in submission order
    pub fn batches(&self) -> Vec<CapturedBatch> {
        self.state.lock().batches.clone()
    }

    /// Most recent batch
    pub fn last(&self) -> Option<CapturedBatch> {
        self.state.lock().batches.last().cloned()
    }

    /// Number of recorded batches
    pub fn submission_count(&self) -> usize {
        self.state.lock().batches.len()
    }

    /// Highest completed task count
    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }
}

impl SubmissionBoundary for CaptureSubmitter {
    fn submit(&self, batch: &BatchBufferDescriptor<'_>) -> Result<u64> {
        let mut state = self.state.lock();
        if core::mem::take(&mut state.reject_next) {
            return Err(Error::SubmissionFailed);
        }
        state.batches.push(CapturedBatch {
            commands: batch.commands.to_vec(),
            gpu_start: batch.gpu_start,
            used_size: batch.used_size,
            residency: batch.residency.to_vec(),
            flags: batch.flags,
            task_count: batch.task_count,
            tile_mask: batch.tile_mask,
        });
        if !state.manual && !state.hung {
            state.completed = state.completed.max(batch.task_count);
        }
        log::debug!(
            "ember-queue: captured batch {} ({} bytes at {}, {:?})",
            batch.task_count,
            batch.used_size,
            batch.gpu_start,
            batch.flags
        );
        Ok(batch.task_count)
    }

    fn wait_for_task_count(&self, task_count: u64, _timeout_ns: u64) -> WaitStatus {
        let state = self.state.lock();
        if state.hung {
            WaitStatus::GpuHang
        } else if task_count <= state.completed {
            WaitStatus::Ready
        } else {
            WaitStatus::NotReady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(commands: &[u8], task_count: u64) -> BatchBufferDescriptor<'_> {
        BatchBufferDescriptor {
            commands,
            gpu_start: GpuAddr::new(0x1000),
            used_size: commands.len(),
            residency: &[],
            flags: SubmitFlags::TASK_COUNT_POST_SYNC,
            task_count,
            tile_mask: TileMask::first(1),
        }
    }

    #[test]
    fn test_records_and_completes() {
        let capture = CaptureSubmitter::new();
        assert_eq!(capture.submit(&batch(&[0, 0, 0, 0], 1)), Ok(1));
        assert_eq!(capture.submission_count(), 1);
        assert_eq!(capture.wait_for_task_count(1, 0), WaitStatus::Ready);
        assert_eq!(capture.last().map(|b| b.commands.len()), Some(4));
    }

    #[test]
    fn test_manual_completion() {
        let capture = CaptureSubmitter::manual();
        assert_eq!(capture.submit(&batch(&[], 1)), Ok(1));
        assert_eq!(capture.submit(&batch(&[], 2)), Ok(2));
        assert_eq!(capture.wait_for_task_count(1, 0), WaitStatus::NotReady);
        capture.complete_up_to(1);
        assert_eq!(capture.wait_for_task_count(1, 0), WaitStatus::Ready);
        assert_eq!(capture.wait_for_task_count(2, 0), WaitStatus::NotReady);
    }

    #[test]
    fn test_hang_and_rejection() {
        let capture = CaptureSubmitter::new();
        capture.reject_next();
        assert_eq!(capture.submit(&batch(&[], 1)), Err(Error::SubmissionFailed));
        assert_eq!(capture.submission_count(), 0);

        capture.inject_hang();
        assert_eq!(capture.submit(&batch(&[], 1)), Ok(1));
        assert_eq!(capture.wait_for_task_count(1, 0), WaitStatus::GpuHang);
    }
}
