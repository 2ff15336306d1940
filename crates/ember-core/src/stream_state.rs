//! # Stream State
//!
//! Tracking of the hardware configuration axes that must be established
//! before dependent commands execute.
//!
//! Every field is an [`StreamProperty`]: an optional value plus a dirty bit.
//! `None` means "never programmed" and is distinct from every concrete
//! value, including the platform default. Setting a field to a value that
//! differs from the current one marks it dirty; emitting the transition
//! command clears the bit.
//!
//! ```text
//!   operation requirements ──apply──▶ StreamState ──dirty fields──▶ encoder
//!                                          │
//!                                    clear_dirty()
//! ```

use crate::family::{PreemptionMode, ThreadArbitration};

// =============================================================================
// STREAM PROPERTY
// =============================================================================

/// One tracked configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperty<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T: Copy + PartialEq> Default for StreamProperty<T> {
    fn default() -> Self {
        Self::unset()
    }
}

impl<T: Copy + PartialEq> StreamProperty<T> {
    /// A property that was never programmed
    pub const fn unset() -> Self {
        Self {
            value: None,
            dirty: false,
        }
    }

    /// Set a concrete value, marking the property dirty if it changes
    #[inline]
    pub fn set(&mut self, value: T) {
        if self.value != Some(value) {
            self.value = Some(value);
            self.dirty = true;
        }
    }

    /// Set when a requirement is present, ignore otherwise
    #[inline]
    pub fn set_opt(&mut self, value: Option<T>) {
        if let Some(value) = value {
            self.set(value);
        }
    }

    /// Current value
    #[inline]
    pub fn value(&self) -> Option<T> {
        self.value
    }

    /// Whether a value has ever been set
    #[inline]
    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Whether the value changed since the last commit
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the current value as committed
    #[inline]
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Forget the value entirely
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::unset();
    }
}

// =============================================================================
// REQUIREMENTS
// =============================================================================

/// Heap base addresses an operation depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapBases {
    /// General state base address
    pub general_state: u64,
    /// Surface state base address
    pub surface_state: u64,
    /// Dynamic state base address
    pub dynamic_state: u64,
    /// Indirect object base address
    pub indirect_object: u64,
    /// Bindless surface state base address
    pub bindless_surface: u64,
    /// Stateless memory object control state
    pub stateless_mocs: u32,
}

/// State an operation needs established before it runs.
///
/// `None` leaves the corresponding axis untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateRequirements {
    /// Preemption granularity
    pub preemption: Option<PreemptionMode>,
    /// Compute-dispatch-all-walker front end bit
    pub compute_dispatch_all_walker: Option<bool>,
    /// Disable EU fusion
    pub disable_eu_fusion: Option<bool>,
    /// Disable overdispatch
    pub disable_overdispatch: Option<bool>,
    /// Single-slice dispatch on the compute command streamer
    pub single_slice_dispatch_ccs: Option<bool>,
    /// Systolic pipeline mode
    pub systolic_mode: Option<bool>,
    /// Media sampler DOP clock gate enable
    pub media_sampler_dop_clock_gate: Option<bool>,
    /// Pixel/compute coherency
    pub coherency_required: Option<bool>,
    /// Large register file
    pub large_grf: Option<bool>,
    /// Thread arbitration policy
    pub thread_arbitration: Option<ThreadArbitration>,
    /// Heap bases
    pub heaps: Option<HeapBases>,
}

// =============================================================================
// STATE GROUPS
// =============================================================================

/// Front end (compute engine) state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontEndProperties {
    /// Compute-dispatch-all-walker
    pub compute_dispatch_all_walker: StreamProperty<bool>,
    /// Disable EU fusion
    pub disable_eu_fusion: StreamProperty<bool>,
    /// Disable overdispatch
    pub disable_overdispatch: StreamProperty<bool>,
    /// Single-slice CCS dispatch
    pub single_slice_dispatch_ccs: StreamProperty<bool>,
}

impl FrontEndProperties {
    fn apply(&mut self, req: &StateRequirements) {
        self.compute_dispatch_all_walker.set_opt(req.compute_dispatch_all_walker);
        self.disable_eu_fusion.set_opt(req.disable_eu_fusion);
        self.disable_overdispatch.set_opt(req.disable_overdispatch);
        self.single_slice_dispatch_ccs.set_opt(req.single_slice_dispatch_ccs);
    }

    fn merge(&mut self, other: &Self) {
        self.compute_dispatch_all_walker.set_opt(other.compute_dispatch_all_walker.value());
        self.disable_eu_fusion.set_opt(other.disable_eu_fusion.value());
        self.disable_overdispatch.set_opt(other.disable_overdispatch.value());
        self.single_slice_dispatch_ccs.set_opt(other.single_slice_dispatch_ccs.value());
    }

    /// Whether any field changed
    pub fn is_dirty(&self) -> bool {
        self.compute_dispatch_all_walker.is_dirty()
            || self.disable_eu_fusion.is_dirty()
            || self.disable_overdispatch.is_dirty()
            || self.single_slice_dispatch_ccs.is_dirty()
    }

    /// Whether any field was ever set
    pub fn is_set(&self) -> bool {
        self.compute_dispatch_all_walker.is_set()
            || self.disable_eu_fusion.is_set()
            || self.disable_overdispatch.is_set()
            || self.single_slice_dispatch_ccs.is_set()
    }

    fn clear_dirty(&mut self) {
        self.compute_dispatch_all_walker.clear_dirty();
        self.disable_eu_fusion.clear_dirty();
        self.disable_overdispatch.clear_dirty();
        self.single_slice_dispatch_ccs.clear_dirty();
    }
}

/// Pipeline select state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSelectProperties {
    /// Systolic mode
    pub systolic_mode: StreamProperty<bool>,
    /// Media sampler DOP clock gate
    pub media_sampler_dop_clock_gate: StreamProperty<bool>,
}

impl PipelineSelectProperties {
    fn apply(&mut self, req: &StateRequirements) {
        self.systolic_mode.set_opt(req.systolic_mode);
        self.media_sampler_dop_clock_gate.set_opt(req.media_sampler_dop_clock_gate);
    }

    fn merge(&mut self, other: &Self) {
        self.systolic_mode.set_opt(other.systolic_mode.value());
        self.media_sampler_dop_clock_gate
            .set_opt(other.media_sampler_dop_clock_gate.value());
    }

    /// Whether any field changed
    pub fn is_dirty(&self) -> bool {
        self.systolic_mode.is_dirty() || self.media_sampler_dop_clock_gate.is_dirty()
    }

    /// Whether any field was ever set
    pub fn is_set(&self) -> bool {
        self.systolic_mode.is_set() || self.media_sampler_dop_clock_gate.is_set()
    }

    fn clear_dirty(&mut self) {
        self.systolic_mode.clear_dirty();
        self.media_sampler_dop_clock_gate.clear_dirty();
    }
}

/// State compute mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeModeProperties {
    /// Coherency required
    pub coherency_required: StreamProperty<bool>,
    /// Large register file
    pub large_grf: StreamProperty<bool>,
    /// Thread arbitration policy
    pub thread_arbitration: StreamProperty<ThreadArbitration>,
}

impl ComputeModeProperties {
    fn apply(&mut self, req: &StateRequirements) {
        self.coherency_required.set_opt(req.coherency_required);
        self.large_grf.set_opt(req.large_grf);
        self.thread_arbitration.set_opt(req.thread_arbitration);
    }

    fn merge(&mut self, other: &Self) {
        self.coherency_required.set_opt(other.coherency_required.value());
        self.large_grf.set_opt(other.large_grf.value());
        self.thread_arbitration.set_opt(other.thread_arbitration.value());
    }

    /// Whether any field changed
    pub fn is_dirty(&self) -> bool {
        self.coherency_required.is_dirty()
            || self.large_grf.is_dirty()
            || self.thread_arbitration.is_dirty()
    }

    /// Whether any field was ever set
    pub fn is_set(&self) -> bool {
        self.coherency_required.is_set()
            || self.large_grf.is_set()
            || self.thread_arbitration.is_set()
    }

    fn clear_dirty(&mut self) {
        self.coherency_required.clear_dirty();
        self.large_grf.clear_dirty();
        self.thread_arbitration.clear_dirty();
    }
}

/// State base address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateBaseAddressProperties {
    /// Heap bases as one unit
    pub heaps: StreamProperty<HeapBases>,
}

// =============================================================================
// STREAM STATE
// =============================================================================

/// Complete tracked stream state of a command list or queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState {
    /// Front end
    pub front_end: FrontEndProperties,
    /// Pipeline select
    pub pipeline_select: PipelineSelectProperties,
    /// State compute mode
    pub compute_mode: ComputeModeProperties,
    /// Preemption
    pub preemption: StreamProperty<PreemptionMode>,
    /// State base address
    pub state_base_address: StateBaseAddressProperties,
}

impl StreamState {
    /// Fully unset state
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an operation's requirements
    pub fn apply(&mut self, req: &StateRequirements) {
        self.front_end.apply(req);
        self.pipeline_select.apply(req);
        self.compute_mode.apply(req);
        self.preemption.set_opt(req.preemption);
        self.state_base_address.heaps.set_opt(req.heaps);
    }

    /// Take every value that `other` has set; untouched axes stay as they are.
    ///
    /// Used by queues to diff a list's required state against the state
    /// committed on the hardware context.
    pub fn merge_from(&mut self, other: &StreamState) {
        self.front_end.merge(&other.front_end);
        self.pipeline_select.merge(&other.pipeline_select);
        self.compute_mode.merge(&other.compute_mode);
        self.preemption.set_opt(other.preemption.value());
        self.state_base_address
            .heaps
            .set_opt(other.state_base_address.heaps.value());
    }

    /// Whether any axis changed
    pub fn is_dirty(&self) -> bool {
        self.front_end.is_dirty()
            || self.pipeline_select.is_dirty()
            || self.compute_mode.is_dirty()
            || self.preemption.is_dirty()
            || self.state_base_address.heaps.is_dirty()
    }

    /// Whether nothing was ever set
    pub fn is_unset(&self) -> bool {
        !self.front_end.is_set()
            && !self.pipeline_select.is_set()
            && !self.compute_mode.is_set()
            && !self.preemption.is_set()
            && !self.state_base_address.heaps.is_set()
    }

    /// Mark every axis as committed
    pub fn clear_dirty(&mut self) {
        self.front_end.clear_dirty();
        self.pipeline_select.clear_dirty();
        self.compute_mode.clear_dirty();
        self.preemption.clear_dirty();
        self.state_base_address.heaps.clear_dirty();
    }

    /// Forget every value
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
