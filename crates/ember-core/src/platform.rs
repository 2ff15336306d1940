//! # Platform Capabilities
//!
//! Per-family policy knobs consumed by the dispatch core.
//!
//! Every family provides one strategy object implementing [`PlatformCaps`].
//! The [`PlatformRegistry`] maps families to those objects; it is built once
//! at driver initialization and handed to each device, so nothing in the
//! dispatch path consults process-wide tables.
//!
//! ```text
//!   PlatformRegistry ──get(family)──▶ Arc<dyn PlatformCaps>
//!                                         │
//!          ┌──────────────┬───────────────┼──────────────┬──────────────┐
//!     Gen12LpCaps     XeHpCaps       XeHpcCaps      XeHpgCaps      Xe2HpgCaps
//! ```

use alloc::sync::Arc;
use core::fmt;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::family::{HwFamily, PreemptionMode};

// =============================================================================
// CAPABILITY TRAIT
// =============================================================================

/// Family-specific behavior of the dispatch core.
///
/// Defaults describe a single-tile family with a non-coherent L3.
pub trait PlatformCaps: Send + Sync + fmt::Debug {
    /// Family this object describes
    fn family(&self) -> HwFamily;

    // -------------------------------------------------------------------------
    // Implicit scaling
    // -------------------------------------------------------------------------

    /// Whether walkers may be partitioned across tiles
    fn supports_implicit_scaling(&self) -> bool {
        false
    }

    /// Largest tile count of a logical device of this family
    fn max_tile_count(&self) -> u32 {
        1
    }

    /// Whether static partitioning is the default
    fn preferred_static_partitioning(&self) -> bool {
        true
    }

    /// Whether self-cleanup uses atomics instead of plain stores
    fn use_atomics_for_self_cleanup(&self) -> bool {
        false
    }

    /// Whether tiles synchronize after the walker with atomics
    fn cross_tile_atomic_synchronization(&self) -> bool {
        true
    }

    /// Whether tiles synchronize before the walker starts
    fn synchronize_before_execution(&self) -> bool {
        false
    }

    /// Whether a stalling pipe control follows a partitioned walker
    fn pipe_control_stall_required(&self) -> bool {
        true
    }

    /// Whether each tile waits on every partition's post-sync value
    fn post_sync_semaphores_required(&self) -> bool {
        false
    }

    // -------------------------------------------------------------------------
    // Event packets
    // -------------------------------------------------------------------------

    /// Write every packet of an event on signal/reset, not only those in use
    fn use_signal_all_event_packets(&self) -> bool {
        false
    }

    /// Signal multi-kernel operations with one trailing pipe control
    fn use_pipe_control_multi_kernel_event_sync(&self) -> bool {
        false
    }

    /// Reuse the first packet for the host-scope L3 flush write
    fn compact_l3_flush_event_packet(&self) -> bool {
        false
    }

    /// Size event packet ranges per kernel split for timestamps
    fn use_dynamic_event_packets_count(&self) -> bool {
        false
    }

    /// Whether host-visible signals need an L3 flush after the post-sync
    fn l3_flush_required_for_host_visibility(&self) -> bool {
        true
    }

    /// Whether one walker post-sync fills a whole timestamp packet
    fn unified_timestamp_post_sync(&self) -> bool {
        true
    }

    /// Size of one event packet in bytes
    fn event_packet_size(&self) -> u32 {
        32
    }

    // -------------------------------------------------------------------------
    // Command streamer
    // -------------------------------------------------------------------------

    /// Minimum alignment of a batch buffer jump target and of buffer ends
    fn jump_target_alignment(&self) -> u32 {
        8
    }

    /// Whether command lists may be chained as primary batch buffers
    fn supports_primary_batch_buffer(&self) -> bool {
        false
    }

    /// Whether state compute mode carries the large GRF bit
    fn supports_large_grf(&self) -> bool {
        true
    }

    /// Whether pipeline select carries the systolic bit
    fn supports_systolic(&self) -> bool {
        true
    }

    /// Whether a stalling pipe control must precede state compute mode
    fn pipe_control_before_state_compute_mode(&self) -> bool {
        false
    }

    /// Finest preemption granularity the family supports
    fn default_preemption_mode(&self) -> PreemptionMode {
        PreemptionMode::MidThread
    }

    /// Hardware threads per tile, used to size scratch space
    fn max_hw_threads(&self) -> u32 {
        448
    }
}

// =============================================================================
// FAMILY STRATEGIES
// =============================================================================

/// Gen12LP: single tile, pipe-control based multi-kernel sync
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen12LpCaps;

impl PlatformCaps for Gen12LpCaps {
    fn family(&self) -> HwFamily {
        HwFamily::Gen12Lp
    }

    fn use_pipe_control_multi_kernel_event_sync(&self) -> bool {
        true
    }

    fn unified_timestamp_post_sync(&self) -> bool {
        false
    }

    fn supports_large_grf(&self) -> bool {
        false
    }

    fn supports_systolic(&self) -> bool {
        false
    }

    fn default_preemption_mode(&self) -> PreemptionMode {
        PreemptionMode::ThreadGroup
    }

    fn max_hw_threads(&self) -> u32 {
        672
    }
}

/// XeHP: up to four tiles, dynamic partitioning, atomics for cleanup
#[derive(Debug, Clone, Copy, Default)]
pub struct XeHpCaps;

impl PlatformCaps for XeHpCaps {
    fn family(&self) -> HwFamily {
        HwFamily::XeHpCore
    }

    fn supports_implicit_scaling(&self) -> bool {
        true
    }

    fn max_tile_count(&self) -> u32 {
        4
    }

    fn preferred_static_partitioning(&self) -> bool {
        false
    }

    fn use_atomics_for_self_cleanup(&self) -> bool {
        true
    }

    fn pipe_control_before_state_compute_mode(&self) -> bool {
        true
    }

    fn max_hw_threads(&self) -> u32 {
        4096
    }
}

/// XeHPC: two tiles, static partitioning, primary batch buffers
#[derive(Debug, Clone, Copy, Default)]
pub struct XeHpcCaps;

impl PlatformCaps for XeHpcCaps {
    fn family(&self) -> HwFamily {
        HwFamily::XeHpcCore
    }

    fn supports_implicit_scaling(&self) -> bool {
        true
    }

    fn max_tile_count(&self) -> u32 {
        2
    }

    fn compact_l3_flush_event_packet(&self) -> bool {
        true
    }

    fn jump_target_alignment(&self) -> u32 {
        64
    }

    fn supports_primary_batch_buffer(&self) -> bool {
        true
    }

    fn max_hw_threads(&self) -> u32 {
        8192
    }
}

/// XeHPG: single tile client part
#[derive(Debug, Clone, Copy, Default)]
pub struct XeHpgCaps;

impl PlatformCaps for XeHpgCaps {
    fn family(&self) -> HwFamily {
        HwFamily::XeHpgCore
    }

    fn supports_primary_batch_buffer(&self) -> bool {
        true
    }

    fn pipe_control_before_state_compute_mode(&self) -> bool {
        true
    }

    fn max_hw_threads(&self) -> u32 {
        4096
    }
}

/// Xe2HPG: coherent L3, dynamic packet counts, signal-all packets
#[derive(Debug, Clone, Copy, Default)]
pub struct Xe2HpgCaps;

impl PlatformCaps for Xe2HpgCaps {
    fn family(&self) -> HwFamily {
        HwFamily::Xe2HpgCore
    }

    fn use_signal_all_event_packets(&self) -> bool {
        true
    }

    fn compact_l3_flush_event_packet(&self) -> bool {
        true
    }

    fn use_dynamic_event_packets_count(&self) -> bool {
        true
    }

    fn l3_flush_required_for_host_visibility(&self) -> bool {
        false
    }

    fn jump_target_alignment(&self) -> u32 {
        64
    }

    fn supports_primary_batch_buffer(&self) -> bool {
        true
    }

    fn max_hw_threads(&self) -> u32 {
        5120
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Family → capability object mapping, built once and injected.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    entries: HashMap<HwFamily, Arc<dyn PlatformCaps>>,
}

impl PlatformRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry populated with every built-in family
    pub fn with_default_families() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Gen12LpCaps));
        registry.register(Arc::new(XeHpCaps));
        registry.register(Arc::new(XeHpcCaps));
        registry.register(Arc::new(XeHpgCaps));
        registry.register(Arc::new(Xe2HpgCaps));
        registry
    }

    /// Register (or replace) the strategy object for its family
    pub fn register(&mut self, caps: Arc<dyn PlatformCaps>) -> Option<Arc<dyn PlatformCaps>> {
        let family = caps.family();
        log::debug!("ember: registering platform caps for {}", family);
        self.entries.insert(family, caps)
    }

    /// Look up the strategy object for a family
    pub fn get(&self, family: HwFamily) -> Result<Arc<dyn PlatformCaps>> {
        self.entries.get(&family).cloned().ok_or(Error::NotSupported)
    }

    /// Whether a family is registered
    pub fn contains(&self, family: HwFamily) -> bool {
        self.entries.contains_key(&family)
    }

    /// Number of registered families
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_all_families() {
        let registry = PlatformRegistry::with_default_families();
        assert_eq!(registry.len(), HwFamily::ALL.len());
        for family in HwFamily::ALL {
            assert_eq!(registry.get(family).map(|c| c.family()), Ok(family));
        }
    }

    #[test]
    fn test_empty_registry_rejects_lookup() {
        let registry = PlatformRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.get(HwFamily::XeHpCore).err(), Some(Error::NotSupported));
    }

    #[test]
    fn test_register_replaces_entry() {
        #[derive(Debug)]
        struct Custom;
        impl PlatformCaps for Custom {
            fn family(&self) -> HwFamily {
                HwFamily::XeHpCore
            }
            fn use_signal_all_event_packets(&self) -> bool {
                true
            }
        }

        let mut registry = PlatformRegistry::with_default_families();
        let previous = registry.register(Arc::new(Custom));
        assert!(previous.is_some());
        let caps = registry.get(HwFamily::XeHpCore).ok();
        assert!(caps.is_some_and(|c| c.use_signal_all_event_packets()));
    }

    #[test]
    fn test_multi_tile_families() {
        assert!(XeHpCaps.supports_implicit_scaling());
        assert!(XeHpcCaps.supports_implicit_scaling());
        assert!(!Gen12LpCaps.supports_implicit_scaling());
        assert_eq!(Gen12LpCaps.max_tile_count(), 1);
    }
}
