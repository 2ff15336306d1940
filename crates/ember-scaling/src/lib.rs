//! # EMBER Implicit Scaling
//!
//! Runs one walker across every tile of a multi-tile device.
//!
//! ```text
//!   DispatchConfig ─┐
//!   PlatformCaps ───┴─▶ ScalingPolicy ─▶ PartitionPlan ─▶ ImplicitScaling
//!                                                             │
//!                                   ┌─────────────────────────┼───────────────┐
//!                                   ▼                         ▼               ▼
//!                             static walker            dynamic walker   cross-tile
//!                           (one partition/tile)     (claimed at run     barrier
//!                                                        time, ≤ 16)
//! ```
//!
//! A plan with one partition bypasses the partition protocol entirely and
//! emits a plain walker.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod dispatch;
pub mod partition;
pub mod policy;
pub mod walker_partition;

pub use dispatch::{emit_partition_registers, DispatchOptions, ImplicitScaling, PARTITION_REGISTERS_SIZE};
pub use partition::{select_partitions, PartitionPlan, MAX_DYNAMIC_PARTITIONS};
pub use policy::ScalingPolicy;
pub use walker_partition::{SemaphoreTargets, WalkerPartitionArgs};
