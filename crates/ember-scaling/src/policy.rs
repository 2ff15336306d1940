//! # Implicit Scaling Policy
//!
//! Family defaults from [`PlatformCaps`] with [`DispatchConfig`] overrides
//! applied, resolved once per device.

use ember_cmd::Device;
use ember_core::{DispatchConfig, EngineGroupType, PartitionType, PlatformCaps};

/// Resolved partitioning policy of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Tiles walkers are split across; 1 disables partitioning
    pub tile_count: u32,
    /// Static instead of dynamic partitioning
    pub static_partitioning: bool,
    /// Synchronize tiles before the walker
    pub synchronize_before_execution: bool,
    /// Synchronize tiles after the walker with atomics
    pub cross_tile_atomic_sync: bool,
    /// Zero control sections with atomics instead of stores
    pub use_atomics_for_self_cleanup: bool,
    /// Forced self-cleanup decision
    pub self_cleanup_override: Option<bool>,
    /// Stalling pipe control after the walker
    pub pipe_control_stall: bool,
    /// Per-partition post-sync semaphores
    pub post_sync_semaphores: bool,
    /// Forced partition axis
    pub partition_type: Option<PartitionType>,
    /// Minimal work-groups per dynamic partition
    pub minimal_partition_size: u32,
}

impl ScalingPolicy {
    /// Resolve family defaults against overrides
    pub fn new(caps: &dyn PlatformCaps, config: &DispatchConfig, tile_count: u32) -> Self {
        Self {
            tile_count,
            static_partitioning: config
                .static_partitioning
                .unwrap_or_else(|| caps.preferred_static_partitioning()),
            synchronize_before_execution: config
                .synchronize_before_execution
                .unwrap_or_else(|| caps.synchronize_before_execution()),
            cross_tile_atomic_sync: config
                .cross_tile_atomic_sync
                .unwrap_or_else(|| caps.cross_tile_atomic_synchronization()),
            use_atomics_for_self_cleanup: config
                .atomics_for_self_cleanup
                .unwrap_or_else(|| caps.use_atomics_for_self_cleanup()),
            self_cleanup_override: config.self_cleanup,
            pipe_control_stall: config
                .pipe_control_stall
                .unwrap_or_else(|| caps.pipe_control_stall_required()),
            post_sync_semaphores: config
                .post_sync_semaphores
                .unwrap_or_else(|| caps.post_sync_semaphores_required()),
            partition_type: config.partition_type,
            minimal_partition_size: config.minimal_partition_size.max(1),
        }
    }

    /// Policy of a device for walkers on `engine`
    pub fn for_device(device: &Device, engine: EngineGroupType) -> Self {
        Self::new(
            device.caps().as_ref(),
            device.config(),
            device.partition_tile_count(engine),
        )
    }

    /// Whether partitioning is possible at all
    pub fn is_enabled(&self) -> bool {
        self.tile_count > 1
    }

    /// Whether control sections zero themselves after use.
    ///
    /// Required when tiles synchronize through counters that a dynamic
    /// partitioning leaves behind; static partitioning and a policy with
    /// neither synchronization need no cleanup.
    pub fn self_cleanup(&self, is_static: bool) -> bool {
        self.self_cleanup_override.unwrap_or(
            (self.cross_tile_atomic_sync || self.synchronize_before_execution) && !is_static,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HwFamily, PlatformRegistry};

    fn caps(family: HwFamily) -> alloc::sync::Arc<dyn PlatformCaps> {
        let registry = PlatformRegistry::with_default_families();
        match registry.get(family) {
            Ok(caps) => caps,
            Err(_) => panic!("family registered"),
        }
    }

    #[test]
    fn test_self_cleanup_rule() {
        let mut policy = ScalingPolicy::new(
            caps(HwFamily::XeHpcCore).as_ref(),
            &DispatchConfig::default(),
            2,
        );
        policy.cross_tile_atomic_sync = true;
        policy.synchronize_before_execution = false;
        assert!(policy.self_cleanup(false));
        assert!(!policy.self_cleanup(true));

        policy.cross_tile_atomic_sync = false;
        assert!(!policy.self_cleanup(false));
        policy.synchronize_before_execution = true;
        assert!(policy.self_cleanup(false));

        policy.self_cleanup_override = Some(false);
        assert!(!policy.self_cleanup(false));
        policy.self_cleanup_override = Some(true);
        assert!(policy.self_cleanup(true));
    }

    #[test]
    fn test_config_overrides_family() {
        let config = DispatchConfig {
            static_partitioning: Some(false),
            pipe_control_stall: Some(false),
            ..Default::default()
        };
        let policy = ScalingPolicy::new(caps(HwFamily::XeHpCore).as_ref(), &config, 4);
        assert!(!policy.static_partitioning);
        assert!(!policy.pipe_control_stall);
        assert!(policy.is_enabled());
    }
}
