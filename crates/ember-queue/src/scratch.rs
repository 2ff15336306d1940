//! # Scratch Controller
//!
//! Owns the queue's scratch space. Kernels only record how much private
//! memory each hardware thread needs; the controller grows the backing
//! allocation when a submission needs more and reports the growth so the
//! queue re-emits the front end state with the new base.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{
    AllocationId, AllocationInfo, AllocationKind, ByteSize, GpuAddr, MemoryBackend, Result,
};

/// Scratch space of one queue
#[derive(Debug)]
pub struct ScratchController {
    memory: Arc<dyn MemoryBackend>,
    threads: u32,
    per_thread: u32,
    current: Option<AllocationInfo>,
    /// Replaced allocations; in-flight work may still reference them
    retired: Vec<AllocationId>,
}

impl ScratchController {
    /// Controller for `threads` hardware threads across all tiles
    pub fn new(memory: Arc<dyn MemoryBackend>, threads: u32) -> Self {
        Self {
            memory,
            threads,
            per_thread: 0,
            current: None,
            retired: Vec::new(),
        }
    }

    /// Make room for `per_thread` bytes on every thread.
    ///
    /// Returns whether the scratch base changed.
    pub fn ensure(&mut self, per_thread: u32) -> Result<bool> {
        if per_thread <= self.per_thread {
            return Ok(false);
        }

        let size = ByteSize::from_bytes(u64::from(per_thread) * u64::from(self.threads))
            .align_up(ByteSize::KIB_64.as_bytes());
        let fresh = self.memory.allocate(size, AllocationKind::Scratch)?;
        log::debug!(
            "ember-queue: scratch grown to {} bytes/thread ({} bytes at {})",
            per_thread,
            size.as_bytes(),
            fresh.gpu_base
        );
        if let Some(old) = self.current.replace(fresh) {
            self.retired.push(old.id);
        }
        self.per_thread = per_thread;
        Ok(true)
    }

    /// Bytes per thread currently backed
    pub fn per_thread(&self) -> u32 {
        self.per_thread
    }

    /// Scratch base, if any scratch was requested
    pub fn address(&self) -> Option<GpuAddr> {
        self.current.as_ref().map(|info| info.gpu_base)
    }

    /// Allocation backing the scratch space
    pub fn allocation(&self) -> Option<AllocationId> {
        self.current.as_ref().map(|info| info.id)
    }
}

impl Drop for ScratchController {
    fn drop(&mut self) {
        let current = self.current.take().map(|info| info.id);
        for id in self.retired.drain(..).chain(current) {
            if let Err(e) = self.memory.free(id) {
                log::warn!("ember-queue: failed to free scratch {:?}: {}", id, e);
            }
        }
    }
}
