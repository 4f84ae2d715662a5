//! Core hypervisor abstraction trait.

use async_trait::async_trait;

use crate::error::BackendResult;

/// Raw description of a domain as returned by a listing: the descriptor plus
/// the live status, each of which may have failed on its own.
#[derive(Debug, Clone)]
pub struct RawDomain {
    pub xml: String,
    pub active: BackendResult<bool>,
}

/// Streamed upload into a volume.
///
/// A stream is opened on an existing volume, fed with [`send`](Self::send)
/// and closed with either [`finish`](Self::finish) or [`abort`](Self::abort).
#[async_trait]
pub trait UploadStream: Send {
    /// Send a chunk, returning how many bytes were accepted.
    async fn send(&mut self, data: &[u8]) -> BackendResult<usize>;

    /// Finalize the transfer.
    ///
    /// A driver that cannot finalize streams reports
    /// [`BackendError::Unsupported`](crate::error::BackendError::Unsupported).
    async fn finish(&mut self) -> BackendResult<()>;

    /// Cancel the transfer.
    async fn abort(&mut self) -> BackendResult<()>;
}

/// Native seam of the hypervisor layer.
///
/// A backend answers with raw descriptors and native errors. Decoding and
/// error context are left to [`HypervisorClient`](crate::HypervisorClient).
/// Every native handle obtained inside a call is released before the call
/// returns.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// URI of the connection, for messages.
    fn uri(&self) -> &str;

    /// Release the connection.
    async fn close(&self) -> BackendResult<()>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Descriptors of every network, one result per network.
    async fn list_networks(&self) -> BackendResult<Vec<BackendResult<String>>>;

    /// Descriptor of a network by name.
    async fn network_xml(&self, name: &str) -> BackendResult<String>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Descriptors and status of every domain, one result per domain.
    async fn list_domains(&self) -> BackendResult<Vec<BackendResult<RawDomain>>>;

    /// Descriptor of a domain by name.
    async fn domain_xml(&self, name: &str) -> BackendResult<String>;

    /// Live status of a domain.
    async fn domain_is_active(&self, name: &str) -> BackendResult<bool>;

    /// Request a start of a domain.
    async fn start_domain(&self, name: &str) -> BackendResult<()>;

    /// Request a graceful shutdown of a domain. Completion is not awaited.
    async fn shutdown_domain(&self, name: &str) -> BackendResult<()>;

    // =========================================================================
    // Storage
    // =========================================================================

    /// Descriptors of every storage pool, one result per pool.
    async fn list_pools(&self) -> BackendResult<Vec<BackendResult<String>>>;

    /// Descriptor of a storage pool by name.
    async fn pool_xml(&self, name: &str) -> BackendResult<String>;

    /// Descriptors of the volumes of a pool, one result per volume.
    async fn list_volumes(&self, pool: &str) -> BackendResult<Vec<BackendResult<String>>>;

    /// Descriptor of a volume by pool and name.
    async fn volume_xml(&self, pool: &str, name: &str) -> BackendResult<String>;

    /// Descriptor of a volume by its path on the hypervisor.
    async fn volume_xml_by_path(&self, path: &str) -> BackendResult<String>;

    /// Define a new volume in a pool from its XML definition, returning the
    /// descriptor of the created volume.
    async fn create_volume(&self, pool: &str, xml: &str) -> BackendResult<String>;

    /// Delete a volume.
    async fn delete_volume(&self, pool: &str, name: &str) -> BackendResult<()>;

    /// Open an upload stream covering `length` bytes of an existing volume.
    async fn open_upload(
        &self,
        pool: &str,
        name: &str,
        length: u64,
    ) -> BackendResult<Box<dyn UploadStream>>;
}
