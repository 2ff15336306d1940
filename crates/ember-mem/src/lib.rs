//! # EMBER Memory Management
//!
//! GPU virtual address space, allocation bookkeeping and residency for the
//! dispatch core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       EMBER Memory System                       │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                        SvmManager                         │  │
//! │  │   GpuAllocator + AllocationResolver + ResidencyManager    │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │            │                     │                    │         │
//! │  ┌─────────┴────────┐  ┌─────────┴────────┐  ┌────────┴──────┐  │
//! │  │  Address Space   │  │ Allocation table │  │ Resident set  │  │
//! │  │   (first fit)    │  │ (by GPU address) │  │               │  │
//! │  └──────────────────┘  └──────────────────┘  └───────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unified shared memory uses one address space for host and device, so a
//! [`UsmPtr`](ember_core::UsmPtr) handed out by the manager is numerically
//! equal to its GPU address.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod address_space;
pub mod manager;
pub mod residency;

// Re-exports
pub use address_space::{AddressSpace, VaRange};
pub use manager::{MemoryStats, SvmManager, SvmManagerConfig};
pub use residency::ResidencyContainer;
