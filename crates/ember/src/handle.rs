//! # Handles
//!
//! Typed [`Handle`]s to objects owned by an [`Api`](crate::Api).
//! Handle zero is null; every live object has a distinct non-zero id.

pub use ember_core::Handle;

// Marker types for handles
/// Marker for device handles
#[derive(Debug)]
pub enum DeviceMarker {}
/// Marker for command list handles
#[derive(Debug)]
pub enum CommandListMarker {}
/// Marker for command queue handles
#[derive(Debug)]
pub enum CommandQueueMarker {}
/// Marker for event pool handles
#[derive(Debug)]
pub enum EventPoolMarker {}
/// Marker for event handles
#[derive(Debug)]
pub enum EventMarker {}
/// Marker for fence handles
#[derive(Debug)]
pub enum FenceMarker {}
/// Marker for kernel handles
#[derive(Debug)]
pub enum KernelMarker {}

/// Handle to a device
pub type DeviceHandle = Handle<DeviceMarker>;
/// Handle to a command list, regular or immediate
pub type CommandListHandle = Handle<CommandListMarker>;
/// Handle to a command queue
pub type CommandQueueHandle = Handle<CommandQueueMarker>;
/// Handle to an event pool
pub type EventPoolHandle = Handle<EventPoolMarker>;
/// Handle to an event
pub type EventHandle = Handle<EventMarker>;
/// Handle to a fence
pub type FenceHandle = Handle<FenceMarker>;
/// Handle to a kernel
pub type KernelHandle = Handle<KernelMarker>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_null_handle() {
        assert!(DeviceHandle::null().is_null());
        assert!(!DeviceHandle::new(3).is_null());
        assert_eq!(EventHandle::new(7), EventHandle::new(7));
        assert_eq!(format!("{:?}", FenceHandle::new(0x10)), "Handle<FenceMarker>(0x10)");
    }
}
