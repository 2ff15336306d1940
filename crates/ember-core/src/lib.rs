//! # EMBER Core
//!
//! Foundational types shared by every layer of the EMBER compute dispatch
//! core: errors, strong address types, hardware families, the platform
//! capability registry, stream state tracking and dispatch configuration.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ember-core                              │
//! │  ┌───────────┐  ┌────────────┐  ┌──────────────┐  ┌───────────┐  │
//! │  │  Error    │  │   Types    │  │  Platform    │  │  Stream   │  │
//! │  │ (Result)  │  │ (GpuAddr,  │  │  Registry    │  │  State    │  │
//! │  │           │  │  TileMask) │  │ (per family) │  │ (Option)  │  │
//! │  └───────────┘  └────────────┘  └──────────────┘  └───────────┘  │
//! │  ┌──────────────────────────┐  ┌───────────────────────────────┐ │
//! │  │  DispatchConfig          │  │  External traits (memory,     │ │
//! │  │  (overrides, no globals) │  │  residency, submission)       │ │
//! │  └──────────────────────────┘  └───────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod family;
pub mod memory;
pub mod platform;
pub mod stream_state;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use config::{DispatchConfig, SubmissionMode};
pub use error::{Error, Result};
pub use family::{EngineGroupType, HwFamily, PreemptionMode, ThreadArbitration};
pub use memory::HostVisibleMemory;
pub use platform::{PlatformCaps, PlatformRegistry};
pub use stream_state::{StateRequirements, StreamProperty, StreamState};
pub use traits::*;
pub use types::*;
