//! # EMBER Command Encoding
//!
//! Hardware command layouts, command streams with chaining, indirect heaps,
//! deferred patching, kernels and the device context.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Command Recording Path                       │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │    HwOp      │    │   Command    │    │     Command      │     │
//! │  │ (what to do) │───▶│   Encoder    │───▶│    Container     │     │
//! │  │              │    │ (per family) │    │ (chained streams)│     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                   │               │
//! │                      ┌──────────────┐    ┌────────▼─────────┐     │
//! │                      │  PatchList   │───▶│  CommandParser   │     │
//! │                      │ (late bound) │    │ (decode / verify)│     │
//! │                      └──────────────┘    └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod cmds;
pub mod container;
pub mod device;
pub mod encoder;
pub mod heap;
pub mod kernel;
pub mod parse;
pub mod patch;
pub mod stream;

// Re-exports
pub use cmds::{CommandKind, HwCommand, PipeControlFlags, PostSyncOp};
pub use container::{CmdLocation, CommandContainer, ContainerStats};
pub use device::{Device, DeviceDesc};
pub use encoder::{CommandEncoder, FamilyEncoder, HwOp, WalkerArgs, WalkerPostSync};
pub use heap::{HeapSlot, IndirectHeap};
pub use kernel::{
    BuiltinKernel, BuiltinProvider, BuiltinTable, Kernel, KernelArg, KernelDescriptor,
    KernelStateRequirements,
};
pub use parse::{Command, CommandParser, ParsedCommand, Segment};
pub use patch::{PatchKind, PatchList, PatchRecord};
pub use stream::LinearStream;
