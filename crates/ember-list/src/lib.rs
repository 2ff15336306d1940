//! # EMBER Command Lists
//!
//! Recording of device work into chained command buffers.
//!
//! ```text
//!   append_* ──▶ waits ──▶ state transitions ──▶ commands ──▶ signal
//!                              │                     │
//!                     required / final        ImplicitScaling
//!                       StreamState           (walkers, barriers)
//!                              │                     │
//!                              └──────▶ CommandContainer ◀── PacketAccounting
//!                                         (buffers, heap,
//!                                          residency, patches)
//! ```
//!
//! A closed list is handed to a queue, which establishes the list's required
//! state before jumping into it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod launch;
pub mod list;
pub mod memory;
pub mod signal;
pub mod state;

pub use list::{CommandList, CommandListFlags, ListProperties, ListStatus};
pub use memory::CopyRegion;
pub use signal::TIMESTAMP_RESULT_SIZE;
pub use state::{emit_front_end, emit_state_transitions, unseen_requirements, TransitionContext};
