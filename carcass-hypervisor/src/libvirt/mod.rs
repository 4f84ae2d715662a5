//! Libvirt hypervisor backend.
//!
//! This module provides the native backend over libvirt. It requires the
//! `libvirt` feature to be enabled and the system to have libvirt installed.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;
