//! # carcass Hypervisor
//!
//! Hypervisor access layer: read-only typed views of networks, domains,
//! storage pools and volumes, domain control and streamed volume uploads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          HypervisorClient               │
//! │  (typed descriptors, error context)     │
//! └─────────────────────┬───────────────────┘
//!                       │ raw XML
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  LibvirtBackend   │     │    MockBackend    │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use carcass_hypervisor::{BackendKind, HypervisorClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = HypervisorClient::connect(BackendKind::Libvirt, "qemu:///system")
//!         .await
//!         .unwrap();
//!
//!     for net in client.list_networks().await.unwrap().items {
//!         println!("{}", net);
//!     }
//!     client.close().await;
//! }
//! ```

pub mod client;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod transfer;
pub mod types;
pub mod xml;

pub use client::{BackendKind, HypervisorClient};
pub use error::{BackendError, BackendResult, HypervisorError, ResourceKind, TransferError};
pub use mock::MockBackend;
pub use traits::{Hypervisor, RawDomain, UploadStream};
pub use transfer::upload;
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
