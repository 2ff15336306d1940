//! # Hardware Families
//!
//! Generation identifiers and the small enums whose encoding is shared by
//! every family.

use core::fmt;

// =============================================================================
// HARDWARE FAMILY
// =============================================================================

/// GPU core family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum HwFamily {
    /// Single-tile integrated/discrete baseline
    Gen12Lp = 0x0C05,
    /// First multi-tile data-center family
    XeHpCore = 0x0C08,
    /// Multi-tile HPC family
    XeHpcCore = 0x0C10,
    /// Single-tile client family
    XeHpgCore = 0x0C0B,
    /// Second generation client family
    Xe2HpgCore = 0x0C20,
}

impl HwFamily {
    /// All known families, oldest first
    pub const ALL: [HwFamily; 5] = [
        Self::Gen12Lp,
        Self::XeHpCore,
        Self::XeHpgCore,
        Self::XeHpcCore,
        Self::Xe2HpgCore,
    ];

    /// Decode a raw product family value
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            0x0C05 => Some(Self::Gen12Lp),
            0x0C08 => Some(Self::XeHpCore),
            0x0C10 => Some(Self::XeHpcCore),
            0x0C0B => Some(Self::XeHpgCore),
            0x0C20 => Some(Self::Xe2HpgCore),
            _ => None,
        }
    }

    /// Raw product family value
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for HwFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gen12Lp => "Gen12LP",
            Self::XeHpCore => "XeHP",
            Self::XeHpcCore => "XeHPC",
            Self::XeHpgCore => "XeHPG",
            Self::Xe2HpgCore => "Xe2HPG",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ENGINE GROUPS
// =============================================================================

/// Engine group a command list or queue targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineGroupType {
    /// Compute command streamer
    #[default]
    Compute,
    /// Render command streamer running compute work
    RenderCompute,
    /// Blitter (copy-only)
    Copy,
}

impl EngineGroupType {
    /// Whether the engine only accepts blitter commands
    pub const fn is_copy_only(self) -> bool {
        matches!(self, Self::Copy)
    }
}

// =============================================================================
// PREEMPTION
// =============================================================================

/// Preemption granularity, ordered from coarsest to finest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreemptionMode {
    /// No preemption
    Disabled,
    /// Preempt between batch buffers
    MidBatch,
    /// Preempt between thread groups
    ThreadGroup,
    /// Preempt mid-thread
    MidThread,
}

impl PreemptionMode {
    /// Effective mode for a kernel given the device ceiling
    pub fn clamp_to(self, device_mode: PreemptionMode) -> PreemptionMode {
        self.min(device_mode)
    }
}

// =============================================================================
// THREAD ARBITRATION
// =============================================================================

/// EU thread arbitration policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadArbitration {
    /// Oldest first
    AgeBased = 0,
    /// Round robin
    RoundRobin = 1,
    /// Round robin after dependency
    RoundRobinAfterDependency = 2,
    /// Stall based
    StallBased = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_roundtrip_raw() {
        for family in HwFamily::ALL {
            assert_eq!(HwFamily::from_raw(family.raw()), Some(family));
        }
        assert_eq!(HwFamily::from_raw(0xdead), None);
    }

    #[test]
    fn test_preemption_clamp() {
        assert_eq!(
            PreemptionMode::MidThread.clamp_to(PreemptionMode::ThreadGroup),
            PreemptionMode::ThreadGroup
        );
        assert_eq!(
            PreemptionMode::MidBatch.clamp_to(PreemptionMode::MidThread),
            PreemptionMode::MidBatch
        );
    }
}
