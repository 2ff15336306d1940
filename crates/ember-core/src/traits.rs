//! # EMBER Core Traits
//!
//! Narrow interfaces to the collaborators the dispatch core consumes but
//! does not own.
//!
//! ## Trait Hierarchy
//!
//! ```text
//! MemoryBackend
//!    ├── GpuAllocator          (command buffers, heaps, pools, tags)
//!    ├── AllocationResolver    (USM pointer → device allocation)
//!    └── ResidencyManager      (make allocations resident)
//!
//! SubmissionBoundary           (hand a batch to the OS / firmware)
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Result;
use crate::memory::HostVisibleMemory;
use crate::types::*;

// =============================================================================
// ALLOCATIONS
// =============================================================================

/// Purpose of a device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Command list or queue buffer
    CommandBuffer,
    /// Indirect object heap
    IndirectHeap,
    /// Kernel ISA
    KernelIsa,
    /// Event pool packets
    EventPool,
    /// Queue task-count tag and ring semaphore
    TagBuffer,
    /// Scratch space
    Scratch,
    /// Per-tile partition ID table
    WorkPartition,
    /// In-order execution counter
    Counter,
    /// Device-local USM
    DeviceUsm,
    /// Host USM
    HostUsm,
    /// Shared USM
    SharedUsm,
}

impl AllocationKind {
    /// Whether the host needs a coherent mapping of this allocation
    pub const fn is_host_visible(self) -> bool {
        matches!(
            self,
            Self::EventPool | Self::TagBuffer | Self::WorkPartition | Self::Counter
        )
    }

    /// Whether the allocation is application USM
    pub const fn is_usm(self) -> bool {
        matches!(self, Self::DeviceUsm | Self::HostUsm | Self::SharedUsm)
    }
}

/// Description of a device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Handle
    pub id: AllocationId,
    /// GPU base address
    pub gpu_base: GpuAddr,
    /// Size
    pub size: ByteSize,
    /// Purpose
    pub kind: AllocationKind,
}

/// Result of resolving a USM pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAllocation {
    /// Backing allocation, `None` for shared-system (host) addresses
    pub id: Option<AllocationId>,
    /// GPU address corresponding to the pointer
    pub gpu_address: GpuAddr,
}

bitflags::bitflags! {
    /// Indirect access classes a kernel may use without naming allocations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndirectAccess: u32 {
        /// Device USM
        const DEVICE = 1 << 0;
        /// Host USM
        const HOST = 1 << 1;
        /// Shared USM
        const SHARED = 1 << 2;
    }
}

/// Allocate device memory for driver-internal objects
pub trait GpuAllocator: Send + Sync {
    /// Allocate `size` bytes for `kind`
    fn allocate(&self, size: ByteSize, kind: AllocationKind) -> Result<AllocationInfo>;

    /// Allocate host-visible memory
    fn allocate_host_visible(
        &self,
        size: ByteSize,
        kind: AllocationKind,
    ) -> Result<Arc<HostVisibleMemory>>;

    /// Release an allocation
    fn free(&self, id: AllocationId) -> Result<()>;

    /// Base of the 4 GiB window every allocation lies in. Walkers address
    /// cross-thread data as an offset from it.
    fn heap_window_base(&self) -> GpuAddr;
}

/// Map application pointers to device allocations
pub trait AllocationResolver: Send + Sync {
    /// Resolve `[ptr, ptr + size)` to the allocation that contains it
    fn resolve(&self, ptr: UsmPtr, size: u64) -> Option<ResolvedAllocation>;

    /// Whether unresolved host pointers may be used directly (shared system USM)
    fn shared_system_fallback(&self) -> bool;
}

/// Residency control
pub trait ResidencyManager: Send + Sync {
    /// Make one allocation resident
    fn mark_resident(&self, id: AllocationId);

    /// Make every USM allocation of the given classes resident, returning them
    fn make_indirect_allocations_resident(&self, access: IndirectAccess) -> Vec<AllocationId>;

    /// Whether an allocation is currently resident
    fn is_resident(&self, id: AllocationId) -> bool;
}

/// Everything the dispatch core needs from the memory manager
pub trait MemoryBackend:
    GpuAllocator + AllocationResolver + ResidencyManager + core::fmt::Debug
{
}

impl<T> MemoryBackend for T where
    T: GpuAllocator + AllocationResolver + ResidencyManager + core::fmt::Debug
{
}

// =============================================================================
// SUBMISSION
// =============================================================================

bitflags::bitflags! {
    /// Properties of a submitted batch
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// The batch contains stalling commands
        const HAS_STALLING_COMMANDS = 1 << 0;
        /// The batch ends with a task-count post-sync
        const TASK_COUNT_POST_SYNC = 1 << 1;
        /// Command lists are chained as primary batch buffers
        const PRIMARY_BATCH_BUFFER = 1 << 2;
        /// The batch continues a ring instead of ending
        const RING = 1 << 3;
        /// Final batch of a ring
        const FINAL = 1 << 4;
        /// Caller will block on completion
        const SYNCHRONOUS = 1 << 5;
        /// Indirect USM allocations were made resident
        const INDIRECT_RESIDENCY = 1 << 6;
    }
}

/// A batch handed to the submission boundary
#[derive(Debug, Clone, Copy)]
pub struct BatchBufferDescriptor<'a> {
    /// Bytes of the batch, starting at `gpu_start`
    pub commands: &'a [u8],
    /// GPU address the command streamer starts at
    pub gpu_start: GpuAddr,
    /// Used size in bytes
    pub used_size: usize,
    /// Allocations that must be resident
    pub residency: &'a [AllocationId],
    /// Batch properties
    pub flags: SubmitFlags,
    /// Task count the batch signals on completion
    pub task_count: u64,
    /// Tiles executing the batch
    pub tile_mask: TileMask,
}

/// Outcome of waiting on a task count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Task count reached
    Ready,
    /// Timeout expired first
    NotReady,
    /// The device hung or was reset
    GpuHang,
}

/// OS / firmware submission boundary
pub trait SubmissionBoundary: Send + Sync + core::fmt::Debug {
    /// Submit a batch, returning the task count it will signal
    fn submit(&self, batch: &BatchBufferDescriptor<'_>) -> Result<u64>;

    /// Wait until `task_count` completes or `timeout_ns` passes
    fn wait_for_task_count(&self, task_count: u64, timeout_ns: u64) -> WaitStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_kind_visibility() {
        assert!(AllocationKind::EventPool.is_host_visible());
        assert!(AllocationKind::TagBuffer.is_host_visible());
        assert!(!AllocationKind::CommandBuffer.is_host_visible());
        assert!(AllocationKind::SharedUsm.is_usm());
    }
}
