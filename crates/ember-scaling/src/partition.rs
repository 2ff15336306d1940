//! # Partition Plan
//!
//! How many partitions a walker is split into, along which axis, and
//! whether partitions map statically onto tiles or are claimed at run time.
//!
//! ## Axis Selection
//!
//! ```text
//!   group start != 0 ─────────────────────────────▶ Disabled, P = 1
//!   requested axis (images force X) ──────────────▶ that axis
//!   static:  Z if it splits within 5% ─┐
//!            Y if it splits within 5% ─┼──────────▶ axis
//!            X if it splits evenly ────┘
//!   otherwise ────────────────────────────────────▶ largest dimension
//! ```
//!
//! ## Partition Count
//!
//! Static plans use one partition per tile. Dynamic plans start from
//! `min(16, work-groups)` rounded down to a power of two and halve while a
//! partition would get fewer than the minimal partition size, never going
//! below the tile count.

use ember_core::{GroupCount, PartitionType, TileMask};

use crate::policy::ScalingPolicy;

/// Most virtual partitions a dynamic plan may use
pub const MAX_DYNAMIC_PARTITIONS: u32 = 16;

/// Idle fraction tolerated when splitting Y or Z statically
pub const IMBALANCE_THRESHOLD: f64 = 0.05;

/// Partitioning of one dispatchable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Number of partitions
    pub partition_count: u32,
    /// Tiles executing the unit
    pub tile_mask: TileMask,
    /// Partitions map one-to-one onto tiles
    pub is_static: bool,
    /// Axis split across partitions
    pub partition_type: PartitionType,
}

impl PartitionPlan {
    /// Unpartitioned plan
    pub const fn single(tile_mask: TileMask) -> Self {
        Self {
            partition_count: 1,
            tile_mask,
            is_static: true,
            partition_type: PartitionType::Disabled,
        }
    }

    /// Whether the dispatch engine has work to do
    pub const fn is_partitioned(&self) -> bool {
        self.partition_count > 1
    }

    /// Packets each kernel occupies in an event
    pub const fn packets_per_kernel(&self) -> u32 {
        if self.partition_count == 0 {
            1
        } else {
            self.partition_count
        }
    }

    /// Plan a walker
    pub fn for_walker(
        policy: &ScalingPolicy,
        group_start: GroupCount,
        group_count: GroupCount,
        uses_images: bool,
    ) -> Self {
        let tile_mask = TileMask::first(policy.tile_count.max(1));
        if !policy.is_enabled() {
            return Self::single(tile_mask);
        }

        let requested = if uses_images {
            Some(PartitionType::X)
        } else {
            policy.partition_type.filter(|t| *t != PartitionType::Disabled)
        };
        let (partition_count, partition_type) = select_partitions(
            group_start,
            group_count,
            requested,
            policy.static_partitioning,
            policy.tile_count,
            policy.minimal_partition_size,
        );

        Self {
            partition_count,
            tile_mask,
            is_static: policy.static_partitioning,
            partition_type,
        }
    }

    /// Plan for a cooperative kernel, which must not be split
    pub fn cooperative(policy: &ScalingPolicy) -> Self {
        Self::single(TileMask::first(policy.tile_count.max(1)))
    }
}

fn imbalance(dimension: u32, partitions: u32) -> f64 {
    let padded = dimension.div_ceil(partitions) * partitions;
    (padded - dimension) as f64 / padded as f64
}

fn select_axis(group_count: GroupCount, prefer_static: bool, tile_count: u32) -> PartitionType {
    let GroupCount { x, y, z } = group_count;
    if prefer_static {
        if z > 1 && imbalance(z, tile_count) <= IMBALANCE_THRESHOLD {
            return PartitionType::Z;
        }
        if y > 1 && imbalance(y, tile_count) < IMBALANCE_THRESHOLD {
            return PartitionType::Y;
        }
        if x % tile_count == 0 {
            return PartitionType::X;
        }
    }

    let max = x.max(y).max(z);
    if max == x {
        PartitionType::X
    } else if max == y {
        PartitionType::Y
    } else {
        PartitionType::Z
    }
}

fn prev_power_of_two(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// Partition count and axis for a walker
pub fn select_partitions(
    group_start: GroupCount,
    group_count: GroupCount,
    requested: Option<PartitionType>,
    static_partitioning: bool,
    tile_count: u32,
    minimal_partition_size: u32,
) -> (u32, PartitionType) {
    if group_start != GroupCount::default() || tile_count <= 1 {
        return (1, PartitionType::Disabled);
    }

    let partition_type =
        requested.unwrap_or_else(|| select_axis(group_count, static_partitioning, tile_count));
    let workgroups = group_count.along(partition_type);

    if static_partitioning {
        return (tile_count, partition_type);
    }

    let mut count = prev_power_of_two(workgroups.min(MAX_DYNAMIC_PARTITIONS));
    let floor = tile_count.max(2);
    while count > floor && workgroups / count < minimal_partition_size {
        count /= 2;
    }

    if count <= 1 {
        (1, PartitionType::Disabled)
    } else {
        (count, partition_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_start_disables_partitioning() {
        let result = select_partitions(
            GroupCount::new(1, 0, 0),
            GroupCount::linear(1024),
            None,
            false,
            2,
            512,
        );
        assert_eq!(result, (1, PartitionType::Disabled));
    }

    #[test]
    fn test_static_uses_tile_count() {
        let zero = GroupCount::default();
        assert_eq!(
            select_partitions(zero, GroupCount::new(64, 1, 1), None, true, 4, 512),
            (4, PartitionType::X)
        );
        // Z splits evenly across 2 tiles
        assert_eq!(
            select_partitions(zero, GroupCount::new(7, 3, 40), None, true, 2, 512),
            (2, PartitionType::Z)
        );
        // Y splits evenly, Z does not
        assert_eq!(
            select_partitions(zero, GroupCount::new(7, 100, 3), None, true, 2, 512),
            (2, PartitionType::Y)
        );
        // Nothing even: largest dimension
        assert_eq!(
            select_partitions(zero, GroupCount::new(3, 9, 1), None, true, 2, 512),
            (2, PartitionType::Y)
        );
    }

    #[test]
    fn test_dynamic_count_respects_minimal_size() {
        let zero = GroupCount::default();
        // 16 partitions of 1024 work-groups each
        assert_eq!(
            select_partitions(zero, GroupCount::linear(16384), None, false, 2, 512),
            (16, PartitionType::X)
        );
        // 4096 / 16 < 512: halve to 8
        assert_eq!(
            select_partitions(zero, GroupCount::linear(4096), None, false, 2, 512),
            (8, PartitionType::X)
        );
        // Never below the tile count
        assert_eq!(
            select_partitions(zero, GroupCount::linear(64), None, false, 4, 512),
            (4, PartitionType::X)
        );
        // Small dispatch on 2 tiles keeps 2
        assert_eq!(
            select_partitions(zero, GroupCount::linear(3), None, false, 2, 512),
            (2, PartitionType::X)
        );
        assert_eq!(
            select_partitions(zero, GroupCount::linear(1), None, false, 2, 512),
            (1, PartitionType::Disabled)
        );
    }

    #[test]
    fn test_images_force_x() {
        let policy = ScalingPolicy {
            tile_count: 2,
            static_partitioning: false,
            synchronize_before_execution: false,
            cross_tile_atomic_sync: true,
            use_atomics_for_self_cleanup: false,
            self_cleanup_override: None,
            pipe_control_stall: true,
            post_sync_semaphores: false,
            partition_type: Some(PartitionType::Z),
            minimal_partition_size: 1,
        };
        let zero = GroupCount::default();
        let plan = PartitionPlan::for_walker(&policy, zero, GroupCount::new(4, 4, 64), true);
        assert_eq!(plan.partition_type, PartitionType::X);
        assert_eq!(plan.partition_count, 4);
        let plan = PartitionPlan::for_walker(&policy, zero, GroupCount::new(4, 4, 64), false);
        assert_eq!(plan.partition_type, PartitionType::Z);
        assert!(!plan.is_static);
    }

    #[test]
    fn test_prev_power_of_two() {
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(15), 8);
        assert_eq!(prev_power_of_two(16), 16);
    }
}
