//! # Event Packet Accounting
//!
//! How many packets of an event one signaling operation occupies, and where
//! each of them lives.
//!
//! ```text
//!   event base
//!   │
//!   ▼
//!   ┌────────┬────────┬────────┬────────┬────────┬────────┬────────┐
//!   │ k0 p0  │ k0 p1  │ k1 p0  │ k1 p1  │ k2 p0  │ k2 p1  │ flush  │
//!   └────────┴────────┴────────┴────────┴────────┴────────┴────────┘
//!    ◀── kernel range 0 ──▶  ...                          ▲
//!                                       base + before × packet size
//! ```
//!
//! Each kernel split owns a range of `max(1, P)` packets, one per partition.
//! A host-scope signal on a family that flushes L3 for host visibility needs
//! one more packet for the flush write, unless the family compacts that
//! write into the first packet.

use ember_cmd::Device;
use ember_core::{DispatchConfig, PlatformCaps};
use ember_scaling::MAX_DYNAMIC_PARTITIONS;

/// Value of a packet that has not been signaled
pub const RESET_SENTINEL: u64 = 1;

/// Value of a signaled packet
pub const SIGNALED_SENTINEL: u64 = 0;

/// Most kernel splits one operation may use (left / middle / right)
pub const MAX_KERNEL_SPLITS: u32 = 3;

/// Visibility a signal or wait must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalScope {
    /// Visible to the device only
    #[default]
    Device,
    /// Visible to the host
    Host,
}

/// Where the completion write of an operation is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSyncPlacement {
    /// Every walker writes its own packets
    Walker,
    /// One barrier after the last walker writes the packets
    DeferredBarrier,
}

/// Where the host-visibility L3 flush writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3FlushWrite {
    /// No flush
    NotRequired,
    /// The flush writes the first packet
    FirstPacket,
    /// The flush writes its own packet at this index
    Packet(u32),
}

/// Event packet policy of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPolicy {
    /// Signal and reset write every packet, queries check every packet
    pub signal_all_packets: bool,
    /// The host-scope flush reuses the first packet
    pub compact_l3_flush_packet: bool,
    /// Timestamp events get one packet range per kernel split
    pub dynamic_packets_count: bool,
    /// Multi-kernel operations signal with one trailing barrier
    pub pipe_control_multi_kernel_sync: bool,
    /// Host-scope signals need an L3 flush
    pub l3_flush_for_host_visibility: bool,
    /// One walker post-sync fills a whole timestamp packet
    pub unified_timestamp_post_sync: bool,
    /// Bytes per packet
    pub packet_size: u32,
    /// Packets per event
    pub max_packets: u32,
}

impl EventPolicy {
    /// Resolve family defaults against overrides
    pub fn new(caps: &dyn PlatformCaps, config: &DispatchConfig, tile_count: u32) -> Self {
        let mut policy = Self {
            signal_all_packets: config
                .signal_all_event_packets
                .unwrap_or_else(|| caps.use_signal_all_event_packets()),
            compact_l3_flush_packet: config
                .compact_l3_flush_event_packet
                .unwrap_or_else(|| caps.compact_l3_flush_event_packet()),
            dynamic_packets_count: config
                .dynamic_event_packets_count
                .unwrap_or_else(|| caps.use_dynamic_event_packets_count()),
            pipe_control_multi_kernel_sync: config
                .pipe_control_multi_kernel_event_sync
                .unwrap_or_else(|| caps.use_pipe_control_multi_kernel_event_sync()),
            l3_flush_for_host_visibility: caps.l3_flush_required_for_host_visibility(),
            unified_timestamp_post_sync: caps.unified_timestamp_post_sync(),
            packet_size: caps.event_packet_size(),
            max_packets: 0,
        };

        let partitions = if tile_count > 1 {
            MAX_DYNAMIC_PARTITIONS
        } else {
            1
        };
        let flush = u32::from(policy.separate_flush_packet(SignalScope::Host));
        let minimum = partitions + flush;
        policy.max_packets = config
            .max_event_packets
            .unwrap_or(MAX_KERNEL_SPLITS * partitions + flush)
            .max(minimum);
        policy
    }

    /// Policy of a device
    pub fn for_device(device: &Device) -> Self {
        Self::new(device.caps().as_ref(), device.config(), device.tile_count())
    }

    /// Bytes of one event
    pub fn event_size(&self) -> usize {
        self.max_packets as usize * self.packet_size as usize
    }

    fn separate_flush_packet(&self, scope: SignalScope) -> bool {
        scope == SignalScope::Host && self.l3_flush_for_host_visibility && !self.compact_l3_flush_packet
    }

    /// Where the completion write of an operation with `kernel_count`
    /// kernels goes
    pub fn post_sync_placement(&self, kernel_count: u32, scope: SignalScope) -> PostSyncPlacement {
        if kernel_count > 1 && self.pipe_control_multi_kernel_sync {
            return PostSyncPlacement::DeferredBarrier;
        }
        if scope == SignalScope::Host && self.l3_flush_for_host_visibility && self.compact_l3_flush_packet {
            // The flush must land before the packet it shares
            return PostSyncPlacement::DeferredBarrier;
        }
        PostSyncPlacement::Walker
    }

    /// Most kernel splits an operation over `partition_count` partitions
    /// may use without overflowing the event
    pub fn max_kernel_splits(&self, partition_count: u32, scope: SignalScope) -> u32 {
        let per_kernel = partition_count.max(1);
        let flush = u32::from(self.separate_flush_packet(scope));
        (self.max_packets.saturating_sub(flush) / per_kernel).clamp(1, MAX_KERNEL_SPLITS)
    }
}

/// One signaling operation as seen by packet accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRequest {
    /// The event records kernel timestamps
    pub is_timestamp: bool,
    /// Kernel splits of the operation
    pub kernel_count: u32,
    /// Partitions of each kernel
    pub partition_count: u32,
    /// Signal scope of the event
    pub scope: SignalScope,
}

/// Packets one operation occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketAccounting {
    /// Completion write placement
    pub placement: PostSyncPlacement,
    /// Separate packet ranges
    pub kernel_ranges: u32,
    /// Packets per range
    pub packets_per_kernel: u32,
    /// Packets the host must see signaled
    pub packets_in_use: u32,
    /// Host-visibility flush
    pub l3_flush: L3FlushWrite,
    /// Kernel splits were reduced to fit the event
    pub clamped: bool,
}

impl PacketAccounting {
    /// Packet index of the first packet of `kernel`
    pub fn kernel_packet(&self, kernel: u32) -> u32 {
        if kernel >= self.kernel_ranges {
            // Compacted splits share the last range
            (self.kernel_ranges - 1) * self.packets_per_kernel
        } else {
            kernel * self.packets_per_kernel
        }
    }

    /// Packets written by kernels, without the flush packet
    pub fn kernel_packets(&self) -> u32 {
        self.kernel_ranges * self.packets_per_kernel
    }
}

/// Account the packets of one signaling operation.
///
/// Base demand is `K × max(1, P)`. Timestamp events without dynamic packet
/// counts compact every split into one range. A host-scope signal that
/// needs an L3 flush adds one packet after the kernel packets unless the
/// flush is compacted into the first packet. Kernel splits are clamped so
/// the demand never exceeds `max_packets`.
pub fn account_packets(policy: &EventPolicy, request: &PacketRequest) -> PacketAccounting {
    let per_kernel = request.partition_count.max(1);
    let kernels = request.kernel_count.max(1);
    debug_assert!(per_kernel <= policy.max_packets);

    let placement = policy.post_sync_placement(kernels, request.scope);
    let mut ranges = match placement {
        PostSyncPlacement::DeferredBarrier => 1,
        PostSyncPlacement::Walker if request.is_timestamp && !policy.dynamic_packets_count => 1,
        PostSyncPlacement::Walker => kernels,
    };

    let limit = policy.max_kernel_splits(per_kernel, request.scope);
    let clamped = ranges > limit;
    if clamped {
        log::warn!(
            "ember-event: clamped {} kernel splits to {} ({} packets per event)",
            ranges,
            limit,
            policy.max_packets
        );
        ranges = limit;
    }

    let before = ranges * per_kernel;
    let host_flush = request.scope == SignalScope::Host && policy.l3_flush_for_host_visibility;
    let l3_flush = if !host_flush {
        L3FlushWrite::NotRequired
    } else if placement == PostSyncPlacement::DeferredBarrier || policy.compact_l3_flush_packet {
        L3FlushWrite::FirstPacket
    } else if before < policy.max_packets {
        L3FlushWrite::Packet(before)
    } else {
        L3FlushWrite::FirstPacket
    };

    let packets_in_use = before + u32::from(matches!(l3_flush, L3FlushWrite::Packet(_)));
    debug_assert!(packets_in_use <= policy.max_packets);

    PacketAccounting {
        placement,
        kernel_ranges: ranges,
        packets_per_kernel: per_kernel,
        packets_in_use,
        l3_flush,
        clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_packets: u32) -> EventPolicy {
        EventPolicy {
            signal_all_packets: false,
            compact_l3_flush_packet: false,
            dynamic_packets_count: false,
            pipe_control_multi_kernel_sync: false,
            l3_flush_for_host_visibility: true,
            unified_timestamp_post_sync: true,
            packet_size: 32,
            max_packets,
        }
    }

    fn request(kernels: u32, partitions: u32, scope: SignalScope) -> PacketRequest {
        PacketRequest {
            is_timestamp: false,
            kernel_count: kernels,
            partition_count: partitions,
            scope,
        }
    }

    #[test]
    fn test_host_flush_gets_its_own_packet() {
        let accounting = account_packets(&policy(4), &request(1, 2, SignalScope::Host));
        assert_eq!(accounting.packets_in_use, 3);
        assert_eq!(accounting.l3_flush, L3FlushWrite::Packet(2));
        assert_eq!(accounting.placement, PostSyncPlacement::Walker);
    }

    #[test]
    fn test_compact_flush_reuses_first_packet() {
        let policy = EventPolicy {
            compact_l3_flush_packet: true,
            ..policy(4)
        };
        let accounting = account_packets(&policy, &request(1, 2, SignalScope::Host));
        assert_eq!(accounting.packets_in_use, 2);
        assert_eq!(accounting.l3_flush, L3FlushWrite::FirstPacket);
        assert_eq!(accounting.placement, PostSyncPlacement::DeferredBarrier);
    }

    #[test]
    fn test_packets_fit_event_for_all_partitions_and_splits() {
        for max in [4u32, 9, 17, 49] {
            let policy = policy(max);
            for p in [1u32, 2, 4, 8] {
                if p > max {
                    continue;
                }
                for k in [1u32, 2, 3] {
                    for scope in [SignalScope::Device, SignalScope::Host] {
                        let req = request(k, p, scope);
                        let a = account_packets(&policy, &req);
                        assert!(a.packets_in_use <= max, "max {max} P {p} K {k}");
                        assert_eq!(a, account_packets(&policy, &req));
                        assert!(a.kernel_ranges <= k);
                        assert_eq!(a.clamped, a.kernel_ranges < k);
                    }
                }
            }
        }
    }

    #[test]
    fn test_device_scope_demand_is_kernels_times_partitions() {
        let a = account_packets(&policy(49), &request(3, 8, SignalScope::Device));
        assert_eq!(a.packets_in_use, 24);
        assert_eq!(a.kernel_packet(2), 16);
        assert_eq!(a.l3_flush, L3FlushWrite::NotRequired);
    }

    #[test]
    fn test_timestamp_splits_compact_without_dynamic_count() {
        let mut req = request(3, 2, SignalScope::Device);
        req.is_timestamp = true;
        let a = account_packets(&policy(9), &req);
        assert_eq!(a.kernel_ranges, 1);
        assert_eq!(a.packets_in_use, 2);
        assert_eq!(a.kernel_packet(2), 0);

        let dynamic = EventPolicy {
            dynamic_packets_count: true,
            ..policy(9)
        };
        assert_eq!(account_packets(&dynamic, &req).packets_in_use, 6);
    }

    #[test]
    fn test_multi_kernel_pipe_control_sync_defers() {
        let policy = EventPolicy {
            pipe_control_multi_kernel_sync: true,
            ..policy(9)
        };
        let a = account_packets(&policy, &request(3, 1, SignalScope::Device));
        assert_eq!(a.placement, PostSyncPlacement::DeferredBarrier);
        assert_eq!(a.packets_in_use, 1);
        let a = account_packets(&policy, &request(1, 1, SignalScope::Device));
        assert_eq!(a.placement, PostSyncPlacement::Walker);
    }

    #[test]
    fn test_policy_minimum_packets() {
        let registry = ember_core::PlatformRegistry::with_default_families();
        let Ok(caps) = registry.get(ember_core::HwFamily::XeHpCore) else {
            panic!("family registered");
        };
        let config = DispatchConfig {
            max_event_packets: Some(2),
            ..Default::default()
        };
        let policy = EventPolicy::new(caps.as_ref(), &config, 4);
        assert_eq!(policy.max_packets, MAX_DYNAMIC_PARTITIONS + 1);
        let single = EventPolicy::new(caps.as_ref(), &DispatchConfig::default(), 1);
        assert_eq!(single.max_packets, MAX_KERNEL_SPLITS + 1);
    }
}
