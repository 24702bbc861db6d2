//! Engine modules: the device model and the target resolver.
//!
//! The engine layer is pure. It turns an inventory listing into a device
//! forest and decides where an installation can go. Nothing here runs a tool.

pub mod device;
pub mod resolver;
