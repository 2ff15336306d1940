//! # Queue Preamble
//!
//! The queue remembers the stream state committed on its hardware context.
//! Before jumping into a list it merges the list's required state into the
//! committed one; only axes whose value changes are dirty, and only dirty
//! axes produce commands.
//!
//! ```text
//!   committed ──merge(required of A)──▶ dirty? ──▶ preamble ──▶ A
//!       ▲                                                       │
//!       └──────────────── merge(final of A) ◀───────────────────┘
//! ```

use ember_cmd::encoder::FrontEndModes;
use ember_cmd::{CommandContainer, CommandEncoder, HwOp, PatchList, PipeControlFlags};
use ember_core::stream_state::HeapBases;
use ember_core::{GpuAddr, PreemptionMode, Result, StreamState};
use ember_list::{emit_front_end, emit_state_transitions, TransitionContext};

/// Committed state saved before a submission is built
#[derive(Debug, Clone, Copy)]
pub struct PreambleCheckpoint {
    committed: StreamState,
    refresh_front_end: bool,
}

/// Committed state of a queue's hardware context
#[derive(Debug)]
pub struct Preamble {
    committed: StreamState,
    ctx: TransitionContext,
    /// Always empty: the queue emits the front end with a known scratch base
    patches: PatchList,
    refresh_front_end: bool,
}

impl Preamble {
    /// Nothing committed yet
    pub fn new(ctx: TransitionContext) -> Self {
        Self {
            committed: StreamState::new(),
            ctx,
            patches: PatchList::new(),
            refresh_front_end: false,
        }
    }

    /// State currently committed
    pub fn committed(&self) -> &StreamState {
        &self.committed
    }

    /// Worst-case bytes of one preamble
    pub fn estimate(encoder: &dyn CommandEncoder) -> usize {
        let stall = HwOp::PipeControl {
            flags: PipeControlFlags::STATE_INVALIDATION,
            address: GpuAddr::null(),
            data: 0,
        };
        let ops = [
            HwOp::PipelineSelect {
                systolic: Some(false),
                media_sampler_dop_clock_gate: Some(false),
            },
            HwOp::FrontEndState {
                scratch: GpuAddr::null(),
                max_threads: 0,
                modes: FrontEndModes::default(),
            },
            stall,
            HwOp::StateComputeMode {
                coherency: Some(false),
                large_grf: Some(false),
                thread_arbitration: None,
            },
            HwOp::Preemption(PreemptionMode::MidThread),
            stall,
            HwOp::StateBaseAddress(HeapBases::default()),
        ];
        ops.iter().map(|op| encoder.estimate_size(op)).sum()
    }

    /// Force the next preamble to carry the front end, e.g. after the
    /// scratch base moved
    pub fn invalidate_front_end(&mut self) {
        self.refresh_front_end = true;
    }

    /// Merge a list's entry requirements; returns whether commands are needed
    pub fn stage(&mut self, required: &StreamState) -> bool {
        self.committed.clear_dirty();
        self.committed.merge_from(required);
        self.committed.is_dirty() || self.refresh_front_end
    }

    /// Emit commands for every staged change
    pub fn emit(&mut self, container: &mut CommandContainer, scratch: GpuAddr) -> Result<u32> {
        let ctx = TransitionContext {
            scratch: Some(scratch),
            ..self.ctx
        };
        let mut groups = emit_state_transitions(container, &self.committed, &ctx, &mut self.patches)?;
        if self.refresh_front_end && !self.committed.front_end.is_dirty() {
            emit_front_end(container, &self.committed, &ctx, &mut self.patches)?;
            groups += 1;
        }
        self.refresh_front_end = false;
        self.committed.clear_dirty();
        log::trace!("ember-queue: preamble with {} state group(s)", groups);
        Ok(groups)
    }

    /// Adopt the state a list leaves behind
    pub fn commit(&mut self, final_state: &StreamState) {
        self.committed.merge_from(final_state);
        self.committed.clear_dirty();
    }

    /// Save the committed state
    pub fn checkpoint(&self) -> PreambleCheckpoint {
        PreambleCheckpoint {
            committed: self.committed,
            refresh_front_end: self.refresh_front_end,
        }
    }

    /// Return to a saved state, undoing stages and commits of a submission
    /// that never reached the hardware
    pub fn restore(&mut self, checkpoint: PreambleCheckpoint) {
        self.committed = checkpoint.committed;
        self.refresh_front_end = checkpoint.refresh_front_end;
    }
}
