//! Libvirt backend implementation.

use async_trait::async_trait;
use std::sync::RwLock;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;

use crate::error::{BackendError, BackendResult, HypervisorError, ResourceKind, Result};
use crate::traits::{Hypervisor, RawDomain, UploadStream};

/// Libvirt/QEMU hypervisor backend.
///
/// Lookups open native handles that are released when they go out of scope,
/// so no handle outlives the call that obtained it.
pub struct LibvirtBackend {
    uri: String,
    connection: RwLock<Option<Connect>>,
}

/// Translate a native failure. `kind` and `name` qualify the object the call
/// was about, they are used when the driver reports it as absent.
fn native(kind: ResourceKind, name: &str, e: VirtError) -> BackendError {
    let absent = match e.code() {
        ErrorNumber::NoNetwork => Some(ResourceKind::Network),
        ErrorNumber::NoDomain => Some(ResourceKind::Domain),
        ErrorNumber::NoStoragePool => Some(ResourceKind::Pool),
        ErrorNumber::NoStorageVol => Some(ResourceKind::Volume),
        ErrorNumber::NoSupport => return BackendError::Unsupported(e.to_string()),
        _ => None,
    };
    match absent {
        Some(k) if k == kind => BackendError::not_found(kind, name),
        Some(k) => BackendError::not_found(k, ""),
        None => BackendError::Failed(e.to_string()),
    }
}

impl LibvirtBackend {
    /// Create a new libvirt backend connected to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection: RwLock::new(Some(connection)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> BackendResult<T>) -> BackendResult<T> {
        let guard = self
            .connection
            .read()
            .map_err(|_| BackendError::Failed("lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(BackendError::Failed("connection is closed".to_string())),
        }
    }

    fn lookup_pool(conn: &Connect, pool: &str) -> BackendResult<StoragePool> {
        StoragePool::lookup_by_name(conn, pool).map_err(|e| native(ResourceKind::Pool, pool, e))
    }

    fn lookup_volume(conn: &Connect, pool: &str, name: &str) -> BackendResult<StorageVol> {
        let p = Self::lookup_pool(conn, pool)?;
        StorageVol::lookup_by_name(&p, name).map_err(|e| native(ResourceKind::Volume, name, e))
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self))]
    async fn close(&self) -> BackendResult<()> {
        let mut guard = self
            .connection
            .write()
            .map_err(|_| BackendError::Failed("lock poisoned".to_string()))?;
        if let Some(mut conn) = guard.take() {
            conn.close()
                .map_err(|e| BackendError::Failed(e.to_string()))?;
            debug!("Connection closed");
        }
        Ok(())
    }

    async fn list_networks(&self) -> BackendResult<Vec<BackendResult<String>>> {
        self.with_conn(|conn| {
            let nets = conn
                .list_all_networks(0)
                .map_err(|e| native(ResourceKind::Network, "", e))?;
            Ok(nets
                .iter()
                .map(|n| n.get_xml_desc(0).map_err(|e| native(ResourceKind::Network, "", e)))
                .collect())
        })
    }

    async fn network_xml(&self, name: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            let net = Network::lookup_by_name(conn, name)
                .map_err(|e| native(ResourceKind::Network, name, e))?;
            net.get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Network, name, e))
        })
    }

    async fn list_domains(&self) -> BackendResult<Vec<BackendResult<RawDomain>>> {
        self.with_conn(|conn| {
            let domains = conn
                .list_all_domains(0)
                .map_err(|e| native(ResourceKind::Domain, "", e))?;
            Ok(domains
                .iter()
                .map(|d| -> BackendResult<RawDomain> {
                    let xml = d
                        .get_xml_desc(0)
                        .map_err(|e| native(ResourceKind::Domain, "", e))?;
                    let active = d.is_active().map_err(|e| native(ResourceKind::Domain, "", e));
                    Ok(RawDomain { xml, active })
                })
                .collect())
        })
    }

    async fn domain_xml(&self, name: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_name(conn, name)
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            dom.get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Domain, name, e))
        })
    }

    async fn domain_is_active(&self, name: &str) -> BackendResult<bool> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_name(conn, name)
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            dom.is_active()
                .map_err(|e| native(ResourceKind::Domain, name, e))
        })
    }

    #[instrument(skip(self))]
    async fn start_domain(&self, name: &str) -> BackendResult<()> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_name(conn, name)
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            dom.create()
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            info!("Domain start requested");
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn shutdown_domain(&self, name: &str) -> BackendResult<()> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_name(conn, name)
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            dom.shutdown()
                .map_err(|e| native(ResourceKind::Domain, name, e))?;
            info!("Domain shutdown requested");
            Ok(())
        })
    }

    async fn list_pools(&self) -> BackendResult<Vec<BackendResult<String>>> {
        self.with_conn(|conn| {
            let pools = conn
                .list_all_storage_pools(0)
                .map_err(|e| native(ResourceKind::Pool, "", e))?;
            Ok(pools
                .iter()
                .map(|p| p.get_xml_desc(0).map_err(|e| native(ResourceKind::Pool, "", e)))
                .collect())
        })
    }

    async fn pool_xml(&self, name: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            Self::lookup_pool(conn, name)?
                .get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Pool, name, e))
        })
    }

    async fn list_volumes(&self, pool: &str) -> BackendResult<Vec<BackendResult<String>>> {
        self.with_conn(|conn| {
            let p = Self::lookup_pool(conn, pool)?;
            let volumes = p
                .list_all_volumes(0)
                .map_err(|e| native(ResourceKind::Pool, pool, e))?;
            Ok(volumes
                .iter()
                .map(|v| v.get_xml_desc(0).map_err(|e| native(ResourceKind::Volume, "", e)))
                .collect())
        })
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            Self::lookup_volume(conn, pool, name)?
                .get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Volume, name, e))
        })
    }

    async fn volume_xml_by_path(&self, path: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            let vol = StorageVol::lookup_by_path(conn, path)
                .map_err(|e| native(ResourceKind::Volume, path, e))?;
            vol.get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Volume, path, e))
        })
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> BackendResult<String> {
        self.with_conn(|conn| {
            let p = Self::lookup_pool(conn, pool)?;
            let vol = StorageVol::create_xml(&p, xml, 0)
                .map_err(|e| native(ResourceKind::Pool, pool, e))?;
            vol.get_xml_desc(0)
                .map_err(|e| native(ResourceKind::Volume, "", e))
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, pool: &str, name: &str) -> BackendResult<()> {
        self.with_conn(|conn| {
            Self::lookup_volume(conn, pool, name)?
                .delete(0)
                .map_err(|e| native(ResourceKind::Volume, name, e))
        })
    }

    #[instrument(skip(self))]
    async fn open_upload(
        &self,
        pool: &str,
        name: &str,
        length: u64,
    ) -> BackendResult<Box<dyn UploadStream>> {
        self.with_conn(|conn| {
            let vol = Self::lookup_volume(conn, pool, name)?;
            let stream = Stream::new(conn, 0).map_err(|e| BackendError::Failed(e.to_string()))?;
            vol.upload(&stream, 0, length, 0)
                .map_err(|e| native(ResourceKind::Volume, name, e))?;
            Ok(Box::new(LibvirtUpload {
                stream: Some(stream),
            }) as Box<dyn UploadStream>)
        })
    }
}

/// Upload stream over a native libvirt stream.
struct LibvirtUpload {
    stream: Option<Stream>,
}

impl LibvirtUpload {
    fn closed() -> BackendError {
        BackendError::Failed("stream is closed".to_string())
    }
}

#[async_trait]
impl UploadStream for LibvirtUpload {
    async fn send(&mut self, data: &[u8]) -> BackendResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(Self::closed)?;
        stream
            .send(data)
            .map_err(|e| native(ResourceKind::Volume, "", e))
    }

    async fn finish(&mut self) -> BackendResult<()> {
        let mut stream = self.stream.take().ok_or_else(Self::closed)?;
        stream
            .finish()
            .map_err(|e| native(ResourceKind::Volume, "", e))
    }

    async fn abort(&mut self) -> BackendResult<()> {
        let mut stream = self.stream.take().ok_or_else(Self::closed)?;
        stream
            .abort()
            .map_err(|e| native(ResourceKind::Volume, "", e))
    }
}
