//! # Stream State Transitions
//!
//! Emission of the commands that move the command streamer from one
//! [`StreamState`] to another. Shared by command lists (transitions between
//! operations) and queues (preambles between lists).
//!
//! ```text
//!   dirty group          command(s)
//!   ──────────────────   ─────────────────────────────────────────
//!   pipeline select  ──▶ PIPELINE_SELECT
//!   front end        ──▶ CFE_STATE            (scratch patched late)
//!   compute mode     ──▶ [PIPE_CONTROL] STATE_COMPUTE_MODE
//!   preemption       ──▶ LRI CS_CHICKEN1
//!   heaps            ──▶ PIPE_CONTROL (invalidate) STATE_BASE_ADDRESS
//! ```

use ember_cmd::{CommandContainer, HwOp, PatchKind, PatchList, PipeControlFlags};
use ember_cmd::encoder::FrontEndModes;
use ember_core::{GpuAddr, PlatformCaps, Result, StateRequirements, StreamState};

/// What transition emission needs besides the state itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    /// Scratch base for the front end; `None` records a deferred patch
    pub scratch: Option<GpuAddr>,
    /// Hardware threads programmed into the front end
    pub max_threads: u32,
    /// A stalling pipe control must precede STATE_COMPUTE_MODE
    pub pipe_control_before_compute_mode: bool,
}

impl TransitionContext {
    /// Context for a family, scratch left to the queue
    pub fn for_caps(caps: &dyn PlatformCaps) -> Self {
        Self {
            scratch: None,
            max_threads: caps.max_hw_threads(),
            pipe_control_before_compute_mode: caps.pipe_control_before_state_compute_mode(),
        }
    }
}

/// The part of `req` touching fields `state` never had a value for
pub fn unseen_requirements(state: &StreamState, req: &StateRequirements) -> StateRequirements {
    let fe = &state.front_end;
    let ps = &state.pipeline_select;
    let cm = &state.compute_mode;
    StateRequirements {
        preemption: req.preemption.filter(|_| !state.preemption.is_set()),
        compute_dispatch_all_walker: req
            .compute_dispatch_all_walker
            .filter(|_| !fe.compute_dispatch_all_walker.is_set()),
        disable_eu_fusion: req.disable_eu_fusion.filter(|_| !fe.disable_eu_fusion.is_set()),
        disable_overdispatch: req
            .disable_overdispatch
            .filter(|_| !fe.disable_overdispatch.is_set()),
        single_slice_dispatch_ccs: req
            .single_slice_dispatch_ccs
            .filter(|_| !fe.single_slice_dispatch_ccs.is_set()),
        systolic_mode: req.systolic_mode.filter(|_| !ps.systolic_mode.is_set()),
        media_sampler_dop_clock_gate: req
            .media_sampler_dop_clock_gate
            .filter(|_| !ps.media_sampler_dop_clock_gate.is_set()),
        coherency_required: req
            .coherency_required
            .filter(|_| !cm.coherency_required.is_set()),
        large_grf: req.large_grf.filter(|_| !cm.large_grf.is_set()),
        thread_arbitration: req
            .thread_arbitration
            .filter(|_| !cm.thread_arbitration.is_set()),
        heaps: req
            .heaps
            .filter(|_| !state.state_base_address.heaps.is_set()),
    }
}

fn front_end_modes(state: &StreamState) -> FrontEndModes {
    let fe = &state.front_end;
    FrontEndModes {
        compute_dispatch_all_walker: fe.compute_dispatch_all_walker.value().unwrap_or(false),
        disable_eu_fusion: fe.disable_eu_fusion.value().unwrap_or(false),
        disable_overdispatch: fe.disable_overdispatch.value().unwrap_or(false),
        single_slice_dispatch_ccs: fe.single_slice_dispatch_ccs.value().unwrap_or(false),
    }
}

/// Emit the front end state with the current scratch binding
pub fn emit_front_end(
    container: &mut CommandContainer,
    state: &StreamState,
    ctx: &TransitionContext,
    patches: &mut PatchList,
) -> Result<()> {
    let at = container.emit(&HwOp::FrontEndState {
        scratch: ctx.scratch.unwrap_or_else(GpuAddr::null),
        max_threads: ctx.max_threads,
        modes: front_end_modes(state),
    })?;
    if ctx.scratch.is_none() {
        patches.push(at, PatchKind::ScratchAddress);
    }
    Ok(())
}

/// Emit a transition for every dirty group of `state`.
///
/// Returns the number of groups emitted. Dirty bits are left for the
/// caller to clear.
pub fn emit_state_transitions(
    container: &mut CommandContainer,
    state: &StreamState,
    ctx: &TransitionContext,
    patches: &mut PatchList,
) -> Result<u32> {
    let mut groups = 0;

    if state.pipeline_select.is_dirty() {
        container.emit(&HwOp::PipelineSelect {
            systolic: state.pipeline_select.systolic_mode.value(),
            media_sampler_dop_clock_gate: state.pipeline_select.media_sampler_dop_clock_gate.value(),
        })?;
        groups += 1;
    }

    if state.front_end.is_dirty() {
        emit_front_end(container, state, ctx, patches)?;
        groups += 1;
    }

    if state.compute_mode.is_dirty() {
        if ctx.pipe_control_before_compute_mode {
            container.emit(&HwOp::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                address: GpuAddr::null(),
                data: 0,
            })?;
        }
        let cm = &state.compute_mode;
        container.emit(&HwOp::StateComputeMode {
            coherency: cm.coherency_required.value(),
            large_grf: cm.large_grf.value(),
            thread_arbitration: cm.thread_arbitration.value(),
        })?;
        groups += 1;
    }

    if state.preemption.is_dirty() {
        if let Some(mode) = state.preemption.value() {
            container.emit(&HwOp::Preemption(mode))?;
            groups += 1;
        }
    }

    if state.state_base_address.heaps.is_dirty() {
        if let Some(heaps) = state.state_base_address.heaps.value() {
            container.emit(&HwOp::PipeControl {
                flags: PipeControlFlags::STATE_INVALIDATION,
                address: GpuAddr::null(),
                data: 0,
            })?;
            container.emit(&HwOp::StateBaseAddress(heaps))?;
            groups += 1;
        }
    }

    Ok(groups)
}
