//! # Dispatch Configuration
//!
//! Overrides for platform policy, passed explicitly through the device.
//! Every `Option` left at `None` defers to the family's [`PlatformCaps`].
//!
//! [`PlatformCaps`]: crate::PlatformCaps

use crate::types::{ByteSize, PartitionType};

/// How a queue ends each submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmissionMode {
    /// Every submission ends with a batch buffer end
    #[default]
    Batched,
    /// The queue buffer stays running: each submission ends with a
    /// semaphore-gated jump to the next write position
    Ring,
}

/// Dispatch configuration and debug overrides
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    // =========================================================================
    // Implicit scaling
    // =========================================================================
    /// Enable/disable walker partitioning across tiles
    pub implicit_scaling: Option<bool>,
    /// Force static (`true`) or dynamic (`false`) partitioning
    pub static_partitioning: Option<bool>,
    /// Force self-cleanup of cross-tile control sections on or off
    pub self_cleanup: Option<bool>,
    /// Use atomics (instead of stores) for self-cleanup
    pub atomics_for_self_cleanup: Option<bool>,
    /// Synchronize tiles before the walker starts
    pub synchronize_before_execution: Option<bool>,
    /// Synchronize tiles after the walker with atomics
    pub cross_tile_atomic_sync: Option<bool>,
    /// Emit a stalling pipe control after partitioned walkers
    pub pipe_control_stall: Option<bool>,
    /// Emit per-partition post-sync semaphores
    pub post_sync_semaphores: Option<bool>,
    /// Force the partition axis
    pub partition_type: Option<PartitionType>,
    /// Minimal number of work-groups per dynamic partition
    pub minimal_partition_size: u32,

    // =========================================================================
    // Event packets
    // =========================================================================
    /// Override `use_signal_all_event_packets`
    pub signal_all_event_packets: Option<bool>,
    /// Override `compact_l3_flush_event_packet`
    pub compact_l3_flush_event_packet: Option<bool>,
    /// Override `use_dynamic_event_packets_count`
    pub dynamic_event_packets_count: Option<bool>,
    /// Override `use_pipe_control_multi_kernel_event_sync`
    pub pipe_control_multi_kernel_event_sync: Option<bool>,
    /// Override the number of packets per event
    pub max_event_packets: Option<u32>,

    // =========================================================================
    // Command buffers
    // =========================================================================
    /// Chain command lists as primary batch buffers
    pub primary_batch_buffer: Option<bool>,
    /// Size of each command list buffer
    pub command_buffer_size: ByteSize,
    /// Size of each indirect heap
    pub indirect_heap_size: ByteSize,
    /// Size of each queue buffer
    pub queue_buffer_size: ByteSize,
    /// Queue submission mode
    pub submission_mode: SubmissionMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            implicit_scaling: None,
            static_partitioning: None,
            self_cleanup: None,
            atomics_for_self_cleanup: None,
            synchronize_before_execution: None,
            cross_tile_atomic_sync: None,
            pipe_control_stall: None,
            post_sync_semaphores: None,
            partition_type: None,
            minimal_partition_size: 512,
            signal_all_event_packets: None,
            compact_l3_flush_event_packet: None,
            dynamic_event_packets_count: None,
            pipe_control_multi_kernel_event_sync: None,
            max_event_packets: None,
            primary_batch_buffer: None,
            command_buffer_size: ByteSize::KIB_64,
            indirect_heap_size: ByteSize::KIB_64,
            queue_buffer_size: ByteSize::KIB_64,
            submission_mode: SubmissionMode::Batched,
        }
    }
}
