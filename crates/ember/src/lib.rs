//! # EMBER
//!
//! Multi-tile compute dispatch core. This crate is the public surface: a
//! handle-based [`Api`] over devices, command lists, queues, events and
//! fences, reporting the fixed [`ResultCode`] set.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ember (Api, ResultCode)                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ember-queue   CommandQueue · ImmediateCommandList · Fence       │
//! │  ember-list    CommandList (state machine, launches, copies)     │
//! │  ember-event   EventPool · Event · packet accounting             │
//! │  ember-scaling partition plans · walker partitioning · barriers  │
//! │  ember-cmd     commands · containers · patches · Device          │
//! │  ember-mem     VA space · SvmManager · residency                 │
//! │  ember-core    Error · types · PlatformCaps · StreamState        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Submissions leave through a [`SubmissionBoundary`] supplied at device
//! creation; [`CaptureSubmitter`] records them instead of running them.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod api;
pub mod handle;
pub mod result;

pub use api::{Api, DeviceEntry, KernelDesc};
pub use handle::{
    CommandListHandle, CommandQueueHandle, DeviceHandle, EventHandle, EventPoolHandle,
    FenceHandle, Handle, KernelHandle,
};
pub use result::{ApiResult, ResultCode};

pub use ember_cmd::{DeviceDesc, KernelArg, KernelStateRequirements};
pub use ember_core::{
    AllocationKind, DispatchConfig, EngineGroupType, Error, GroupCount, HwFamily,
    PreemptionMode, SubmissionBoundary, UsmPtr,
};
pub use ember_event::{EventDesc, EventPoolFlags, SignalScope};
pub use ember_list::CommandListFlags;
pub use ember_queue::{CaptureSubmitter, CommandQueueDesc, QueueMode};
