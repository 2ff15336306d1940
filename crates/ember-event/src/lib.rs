//! # EMBER Events
//!
//! Event pools, events and the packet accounting shared with command lists.
//!
//! ```text
//!   EventPool ─── host-visible allocation ───┐
//!      │                                     ▼
//!      └─ create_event ─▶ Event ──▶ packets [0 .. max_packets)
//!                          │
//!       command list ──────┤ account(K, P) ─▶ PacketAccounting
//!                          │                   (addresses, flush packet)
//!       host ──────────────┘ signal / reset / query / timestamps
//! ```
//!
//! The number of packets an operation uses must agree with the partition
//! count the dispatch engine used for the same walker.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod event;
pub mod packets;
pub mod pool;
pub mod timestamp;

pub use event::{Event, EventDesc, EventStatus};
pub use packets::{
    account_packets, EventPolicy, L3FlushWrite, PacketAccounting, PacketRequest,
    PostSyncPlacement, SignalScope, MAX_KERNEL_SPLITS, RESET_SENTINEL, SIGNALED_SENTINEL,
};
pub use pool::{EventPool, EventPoolDesc, EventPoolFlags};
pub use timestamp::{KernelTimestampResult, TimestampRange};
