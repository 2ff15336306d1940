//! # Command List
//!
//! Records operations into a [`CommandContainer`] and tracks the stream
//! state the recorded commands need.
//!
//! ```text
//!          append                 close                reset
//!   Open ─────────▶ Open   Open ─────────▶ Closed ─────────▶ Open
//! ```
//!
//! Two stream states are kept. `required` holds the state the first
//! operation touching each field expects on entry; the queue establishes it
//! before jumping into the list. `final` is the state the list leaves
//! behind. Inside the list only changes of already seen fields emit
//! transition commands.

use alloc::sync::Arc;

use ember_cmd::{CmdLocation, CommandContainer, Device, HwOp, PatchKind, PatchList};
use ember_core::{
    EngineGroupType, Error, GpuAddr, IndirectAccess, Result, StateRequirements, StreamState,
};
use ember_mem::ResidencyContainer;
use ember_scaling::ImplicitScaling;

use crate::state::{emit_state_transitions, unseen_requirements, TransitionContext};

bitflags::bitflags! {
    /// Command list creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandListFlags: u32 {
        /// Operations complete in submission order; immediate lists
        /// advance a completion counter after each one
        const IN_ORDER = 1 << 0;
    }
}

/// Recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    /// Accepting operations
    Open,
    /// Terminated, ready for execution
    Closed,
}

/// What the queue needs to know about recorded work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListProperties {
    /// At least one operation was recorded
    pub has_operations: bool,
    /// Contains commands that stall the command streamer
    pub has_stalling_commands: bool,
    /// Indirect USM access performed by recorded kernels
    pub indirect_access: IndirectAccess,
    /// Largest per-thread scratch of recorded kernels
    pub scratch_per_thread: u32,
    /// Largest partition count of recorded walkers
    pub max_partition_count: u32,
}

/// A command list
#[derive(Debug)]
pub struct CommandList {
    pub(crate) device: Arc<Device>,
    pub(crate) engine: EngineGroupType,
    pub(crate) flags: CommandListFlags,
    pub(crate) container: CommandContainer,
    pub(crate) scaling: ImplicitScaling,
    status: ListStatus,
    required_state: StreamState,
    final_state: StreamState,
    pub(crate) patches: PatchList,
    pub(crate) properties: ListProperties,
    primary_batch_buffer: bool,
    terminal: Option<CmdLocation>,
}

impl CommandList {
    /// Create an open, empty list for `engine` of `device`
    pub fn create(
        device: Arc<Device>,
        engine: EngineGroupType,
        flags: CommandListFlags,
    ) -> Result<Self> {
        let config = device.config();
        let container = CommandContainer::new(
            Arc::clone(device.memory()),
            Arc::clone(device.encoder()),
            config.command_buffer_size,
            config.indirect_heap_size,
            device.jump_target_alignment(),
        )?;
        let scaling = ImplicitScaling::for_device(&device, engine);
        let primary_batch_buffer = device.primary_batch_buffer();

        log::debug!(
            "ember-list: created {:?} list on {} ({} partition tile(s))",
            engine,
            device.family(),
            scaling.policy().tile_count
        );

        Ok(Self {
            device,
            engine,
            flags,
            container,
            scaling,
            status: ListStatus::Open,
            required_state: StreamState::new(),
            final_state: StreamState::new(),
            patches: PatchList::new(),
            properties: ListProperties::default(),
            primary_batch_buffer,
            terminal: None,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Owning device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Engine group
    pub fn engine(&self) -> EngineGroupType {
        self.engine
    }

    /// Creation flags
    pub fn flags(&self) -> CommandListFlags {
        self.flags
    }

    /// Recording state
    pub fn status(&self) -> ListStatus {
        self.status
    }

    /// Whether the list is closed
    pub fn is_closed(&self) -> bool {
        self.status == ListStatus::Closed
    }

    /// Whether no operation was recorded
    pub fn is_empty(&self) -> bool {
        !self.properties.has_operations
    }

    /// State expected on entry
    pub fn required_state(&self) -> &StreamState {
        &self.required_state
    }

    /// State left behind
    pub fn final_state(&self) -> &StreamState {
        &self.final_state
    }

    /// Recorded properties
    pub fn properties(&self) -> &ListProperties {
        &self.properties
    }

    /// Deferred patches
    pub fn patches(&self) -> &PatchList {
        &self.patches
    }

    /// Command storage
    pub fn container(&self) -> &CommandContainer {
        &self.container
    }

    /// Command storage, for patching at submission
    pub fn container_mut(&mut self) -> &mut CommandContainer {
        &mut self.container
    }

    /// Allocations the list references
    pub fn residency(&self) -> &ResidencyContainer {
        self.container.residency()
    }

    /// GPU address of the first command
    pub fn start_address(&self) -> GpuAddr {
        self.container.start_address()
    }

    /// Ends with a first-level jump patched by the queue
    pub fn uses_primary_batch_buffer(&self) -> bool {
        self.primary_batch_buffer
    }

    /// Location of the terminal command once closed
    pub fn terminal(&self) -> Option<CmdLocation> {
        self.terminal
    }

    /// Implicit scaling engine of the list
    pub fn scaling(&self) -> &ImplicitScaling {
        &self.scaling
    }

    /// Resolve deferred patches of a closed list; kinds `resolve` has no
    /// value for are left for a later pass
    pub fn apply_patches<F>(&mut self, resolve: F) -> Result<usize>
    where
        F: FnMut(PatchKind) -> Option<GpuAddr>,
    {
        self.patches.apply(&mut self.container, resolve)
    }

    // =========================================================================
    // State machine
    // =========================================================================

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.status == ListStatus::Closed {
            #[cfg(feature = "validation")]
            debug_assert!(false, "operation appended to a closed command list");
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Terminate the list.
    ///
    /// Appends the end marker (or, in primary batch buffer mode, a jump
    /// whose target the queue patches) and pads to the jump alignment. The
    /// container always keeps room for both, so closing cannot run out of
    /// space.
    pub fn close(&mut self) -> Result<()> {
        if self.status == ListStatus::Closed {
            return Err(Error::InvalidState);
        }

        let terminal = if self.primary_batch_buffer {
            HwOp::BatchBufferStart {
                target: GpuAddr::null(),
                second_level: false,
                predicated: false,
            }
        } else {
            HwOp::BatchBufferEnd
        };
        let at = self.container.terminate(&terminal)?;
        if self.primary_batch_buffer {
            self.patches.push(at, PatchKind::JumpTarget);
        }
        self.terminal = Some(at);
        self.status = ListStatus::Closed;

        log::debug!(
            "ember-list: closed list, {} bytes in {} buffer(s)",
            self.container.total_used(),
            self.container.buffers().len()
        );
        Ok(())
    }

    /// Return to the freshly created state. Idempotent.
    pub fn reset(&mut self) {
        self.container.reset();
        self.clear_recording();
        log::debug!("ember-list: reset list");
    }

    /// Reset while the GPU may still execute the recorded commands as
    /// submission `task`. The list records into other memory until
    /// `is_complete` reports that task done.
    pub fn recycle(&mut self, task: u64, is_complete: impl Fn(u64) -> bool) -> Result<()> {
        self.container.reset_in_flight(task, is_complete)?;
        self.clear_recording();
        log::debug!("ember-list: recycled list after task {}", task);
        Ok(())
    }

    fn clear_recording(&mut self) {
        self.required_state.reset();
        self.final_state.reset();
        self.patches.clear();
        self.properties = ListProperties::default();
        self.terminal = None;
        self.status = ListStatus::Open;
    }

    // =========================================================================
    // Stream state
    // =========================================================================

    pub(crate) fn transition_context(&self) -> TransitionContext {
        TransitionContext::for_caps(self.device.caps().as_ref())
    }

    /// Bring `final` to `req`, emitting transitions for fields that change.
    ///
    /// Fields never seen before become entry requirements instead.
    pub(crate) fn require_state(&mut self, req: &StateRequirements) -> Result<()> {
        if self.engine.is_copy_only() {
            return Ok(());
        }

        let seed = unseen_requirements(&self.final_state, req);
        self.required_state.apply(&seed);
        self.required_state.clear_dirty();
        self.final_state.apply(&seed);
        self.final_state.clear_dirty();

        self.final_state.apply(req);
        if self.final_state.is_dirty() {
            let ctx = self.transition_context();
            let groups =
                emit_state_transitions(&mut self.container, &self.final_state, &ctx, &mut self.patches)?;
            log::trace!("ember-list: {} state transition(s)", groups);
            self.final_state.clear_dirty();
        }
        Ok(())
    }

    pub(crate) fn mark_operation(&mut self) {
        self.properties.has_operations = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, kernel};
    use ember_cmd::parse::{count_kind, CommandParser, Segment};
    use ember_cmd::{CommandKind, KernelStateRequirements};
    use ember_core::{GroupCount, HwFamily, PreemptionMode};

    fn list(device: &Arc<Device>) -> CommandList {
        match CommandList::create(Arc::clone(device), EngineGroupType::Compute, CommandListFlags::empty()) {
            Ok(list) => list,
            Err(e) => panic!("list: {e}"),
        }
    }

    fn parse(list: &CommandList) -> alloc::vec::Vec<ember_cmd::ParsedCommand> {
        let segments = list.container().buffers().iter().map(Segment::from);
        CommandParser::with_segments(segments)
            .follow_jumps(true)
            .parse()
            .unwrap_or_default()
    }

    fn preemption_lri(list: &CommandList) -> usize {
        parse(list)
            .iter()
            .filter(|c| {
                matches!(c.command, ember_cmd::Command::LoadRegisterImm(lri)
                    if lri.register == ember_cmd::cmds::regs::CS_CHICKEN1)
            })
            .count()
    }

    #[test]
    fn test_close_then_append_is_invalid_state() {
        let device = device(HwFamily::XeHpCore, 1);
        let mut list = list(&device);
        assert_eq!(list.close(), Ok(()));
        assert!(list.is_closed());
        assert!(list.is_empty());
        assert_eq!(list.close(), Err(Error::InvalidState));
        let k = kernel(&device, KernelStateRequirements::default());
        assert_eq!(
            list.append_launch_kernel(&k, GroupCount::linear(4), None, &[]),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn test_close_pads_to_jump_alignment() {
        let device = device(HwFamily::XeHpcCore, 1);
        let mut list = list(&device);
        let k = kernel(&device, KernelStateRequirements::default());
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(4), None, &[]), Ok(()));
        assert_eq!(list.close(), Ok(()));
        let used = list.container().buffers()[0].used();
        assert_eq!(used % device.jump_target_alignment() as usize, 0);
        let commands = parse(&list);
        assert!(commands
            .iter()
            .any(|c| c.command.kind() == CommandKind::BatchBufferEnd));
    }

    #[test]
    fn test_reset_is_idempotent_and_reproducible() {
        let device = device(HwFamily::XeHpCore, 2);
        let mut list = list(&device);
        let k = kernel(&device, KernelStateRequirements::default());

        let record = |list: &mut CommandList| {
            assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(4096), None, &[]), Ok(()));
            assert_eq!(list.append_barrier(None, &[]), Ok(()));
            assert_eq!(list.close(), Ok(()));
        };

        record(&mut list);
        let first = list.container().buffers()[0].as_bytes().to_vec();
        list.reset();
        list.reset();
        assert!(!list.is_closed());
        assert!(list.required_state().is_unset());
        assert!(list.patches().is_empty());
        record(&mut list);
        assert_eq!(list.container().buffers()[0].as_bytes(), first.as_slice());
    }

    #[test]
    fn test_preemption_change_emits_one_transition() {
        let device = device(HwFamily::XeHpCore, 1);
        let mut list = list(&device);
        let coarse = kernel(
            &device,
            KernelStateRequirements {
                max_preemption: Some(PreemptionMode::ThreadGroup),
                ..Default::default()
            },
        );
        let fine = kernel(&device, KernelStateRequirements::default());

        assert_eq!(list.append_launch_kernel(&coarse, GroupCount::linear(1), None, &[]), Ok(()));
        assert_eq!(preemption_lri(&list), 0);
        assert_eq!(list.append_launch_kernel(&fine, GroupCount::linear(1), None, &[]), Ok(()));
        assert_eq!(list.close(), Ok(()));

        assert_eq!(preemption_lri(&list), 1);
        assert_eq!(
            list.required_state().preemption.value(),
            Some(PreemptionMode::ThreadGroup)
        );
        assert_eq!(
            list.final_state().preemption.value(),
            Some(PreemptionMode::MidThread)
        );
    }

    #[test]
    fn test_disjoint_operations_commute_in_transition_count() {
        let device = device(HwFamily::XeHpCore, 1);
        let a = kernel(
            &device,
            KernelStateRequirements {
                large_grf: true,
                ..Default::default()
            },
        );
        let b = kernel(
            &device,
            KernelStateRequirements {
                systolic: true,
                ..Default::default()
            },
        );
        let plain = kernel(&device, KernelStateRequirements::default());

        let count = |order: [&ember_cmd::Kernel; 3]| {
            let mut list = list(&device);
            for k in order {
                assert_eq!(list.append_launch_kernel(k, GroupCount::linear(2), None, &[]), Ok(()));
            }
            let commands = parse(&list);
            count_kind(&commands, CommandKind::StateComputeMode)
                + count_kind(&commands, CommandKind::PipelineSelect)
        };
        assert_eq!(count([&plain, &a, &b]), count([&plain, &b, &a]));
    }

    #[test]
    fn test_first_operation_only_seeds_required_state() {
        let device = device(HwFamily::XeHpCore, 1);
        let mut list = list(&device);
        let k = kernel(
            &device,
            KernelStateRequirements {
                large_grf: true,
                ..Default::default()
            },
        );
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(1), None, &[]), Ok(()));
        let commands = parse(&list);
        assert_eq!(count_kind(&commands, CommandKind::StateComputeMode), 0);
        assert_eq!(count_kind(&commands, CommandKind::StateBaseAddress), 0);
        assert_eq!(list.required_state().compute_mode.large_grf.value(), Some(true));
        assert!(list.required_state().state_base_address.heaps.is_set());
    }

    #[test]
    fn test_chained_list_matches_single_buffer_sequence() {
        let small = ember_core::DispatchConfig {
            command_buffer_size: ember_core::ByteSize::from_bytes(1024),
            ..Default::default()
        };
        let chained = crate::testing::device_with(HwFamily::XeHpCore, 1, small);
        let single = device(HwFamily::XeHpCore, 1);
        let k = kernel(&single, KernelStateRequirements::default());
        let k_chained = kernel(&chained, KernelStateRequirements::default());

        let record = |device: &Arc<Device>, k: &ember_cmd::Kernel| {
            let mut list = list(device);
            for _ in 0..12 {
                assert_eq!(list.append_launch_kernel(k, GroupCount::linear(8), None, &[]), Ok(()));
            }
            assert_eq!(list.close(), Ok(()));
            list
        };
        let a = record(&single, &k);
        let b = record(&chained, &k_chained);
        assert_eq!(a.container().buffers().len(), 1);
        assert!(b.container().buffers().len() > 1);

        let kinds = |list: &CommandList| {
            parse(list)
                .iter()
                .map(|c| c.command.kind())
                .filter(|k| !matches!(k, CommandKind::Noop | CommandKind::BatchBufferStart))
                .collect::<alloc::vec::Vec<_>>()
        };
        assert_eq!(kinds(&a), kinds(&b));
    }

    #[test]
    fn test_primary_batch_buffer_close_records_jump_patch() {
        let config = ember_core::DispatchConfig {
            primary_batch_buffer: Some(true),
            ..Default::default()
        };
        let device = crate::testing::device_with(HwFamily::XeHpcCore, 1, config);
        let mut list = list(&device);
        assert!(list.uses_primary_batch_buffer());
        assert_eq!(list.close(), Ok(()));
        assert!(list.patches().has(PatchKind::JumpTarget));
        assert_eq!(list.terminal(), Some(CmdLocation { buffer: 0, offset: 0 }));
    }
}
