//! # EMBER Command Queues
//!
//! Submission of closed command lists to an engine.
//!
//! ```text
//!   CommandList ─┐                      ┌─▶ SubmissionBoundary::submit
//!   CommandList ─┼─▶ CommandQueue ──────┤     (BatchBufferDescriptor)
//!   Event waits ─┘    │ lock            └─▶ Fence::arm(task count)
//!                     ├─ Preamble        (committed StreamState diff)
//!                     ├─ ListChain       (second level calls, primary jumps)
//!                     ├─ ScratchController
//!                     └─ queue buffers   (batched BB_END or ring)
//! ```
//!
//! [`ImmediateCommandList`] wraps a list and a queue and submits after every
//! append. [`CaptureSubmitter`] is a submission boundary that records what
//! the queue hands over and simulates completion.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod capture;
pub mod chain;
pub mod fence;
pub mod immediate;
pub mod preamble;
pub mod queue;
pub mod scratch;

pub use capture::{CaptureSubmitter, CapturedBatch};
pub use fence::{Fence, FenceStatus};
pub use immediate::ImmediateCommandList;
pub use preamble::{Preamble, PreambleCheckpoint};
pub use queue::{CommandQueue, CommandQueueDesc, QueueMode, QueueStats};
pub use scratch::ScratchController;

#[cfg(test)]
pub(crate) mod testing {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use ember_cmd::parse::{CommandParser, Segment};
    use ember_cmd::{Command, Device, DeviceDesc, Kernel, KernelDescriptor, ParsedCommand};
    use ember_core::{
        AllocationKind, ByteSize, DispatchConfig, EngineGroupType, GpuAddr, HwFamily,
        MemoryBackend, PlatformRegistry,
    };
    use ember_list::{CommandList, CommandListFlags};
    use ember_mem::SvmManager;

    use crate::capture::CapturedBatch;

    /// A device together with the memory manager backing it
    #[derive(Debug)]
    pub(crate) struct Env {
        pub(crate) memory: Arc<SvmManager>,
        pub(crate) device: Arc<Device>,
    }

    impl Env {
        pub(crate) fn new(family: HwFamily, tiles: u32) -> Self {
            Self::with_config(family, tiles, DispatchConfig::default())
        }

        pub(crate) fn with_config(family: HwFamily, tiles: u32, config: DispatchConfig) -> Self {
            let memory = Arc::new(SvmManager::default());
            let desc = DeviceDesc {
                family,
                tile_count: tiles,
                config,
            };
            let backend: Arc<dyn MemoryBackend> = memory.clone();
            match Device::new(desc, &PlatformRegistry::with_default_families(), backend) {
                Ok(device) => Self {
                    memory,
                    device: Arc::new(device),
                },
                Err(e) => panic!("device: {e}"),
            }
        }
    }

    /// A SIMD32 kernel with 32 bytes of cross-thread data
    pub(crate) fn kernel(device: &Arc<Device>, configure: impl FnOnce(&mut KernelDescriptor)) -> Kernel {
        let isa = match device
            .memory()
            .allocate(ByteSize::KIB_4, AllocationKind::KernelIsa)
        {
            Ok(info) => info,
            Err(e) => panic!("isa: {e}"),
        };
        let mut desc = KernelDescriptor::new("test_kernel", isa.gpu_base, isa.id);
        desc.simd_size = 32;
        desc.cross_thread_size = 32;
        configure(&mut desc);
        let mut kernel = Kernel::new(Arc::new(desc));
        if let Err(e) = kernel.set_group_size(32, 1, 1) {
            panic!("group size: {e}");
        }
        kernel
    }

    pub(crate) fn list(device: &Arc<Device>, engine: EngineGroupType) -> CommandList {
        match CommandList::create(Arc::clone(device), engine, CommandListFlags::empty()) {
            Ok(list) => list,
            Err(e) => panic!("list: {e}"),
        }
    }

    /// Commands of a captured batch, without following jumps
    pub(crate) fn parse_batch(batch: &CapturedBatch) -> Vec<ParsedCommand> {
        match CommandParser::new(Segment::new(batch.gpu_start, &batch.commands)).parse() {
            Ok(commands) => commands,
            Err(e) => panic!("parse: {e}"),
        }
    }

    /// Every command of a list, following chain jumps
    pub(crate) fn parse_list(list: &CommandList) -> Vec<ParsedCommand> {
        let segments = list.container().buffers().iter().map(Segment::from);
        match CommandParser::with_segments(segments).follow_jumps(true).parse() {
            Ok(commands) => commands,
            Err(e) => panic!("parse: {e}"),
        }
    }

    /// Target of a primary list's terminal jump, once patched
    pub(crate) fn terminal_target(list: &CommandList) -> Option<GpuAddr> {
        let at = list.terminal()?;
        let stream = list.container().buffers().get(at.buffer)?;
        let bytes = stream.as_bytes().get(at.offset..)?;
        let base = stream.gpu_base().offset(at.offset as u64);
        let parsed = CommandParser::new(Segment::new(base, bytes)).parse().ok()?;
        match parsed.first()?.command {
            Command::BatchBufferStart(bbs) if !bbs.target().is_null() => Some(bbs.target()),
            _ => None,
        }
    }
}
