//! Hypervisor client.
//!
//! Wraps a backend connection and turns its raw descriptors into the typed
//! descriptors of [`crate::types`], with failures put in context.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{BackendError, HypervisorError, ResourceKind, Result};
use crate::mock::MockBackend;
use crate::traits::{Hypervisor, UploadStream};
use crate::types::*;
use crate::xml;

/// Backend selection for [`HypervisorClient::connect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Libvirt/QEMU backend
    #[default]
    Libvirt,
    /// In-memory backend for testing/development
    Mock,
}

/// A live connection to a hypervisor.
///
/// Cloning is cheap and shares the connection. Every call is self-contained:
/// descriptors are fetched and decoded on demand, nothing is cached.
#[derive(Clone)]
pub struct HypervisorClient {
    backend: Arc<dyn Hypervisor>,
}

impl HypervisorClient {
    /// Wrap an already connected backend.
    pub fn new(backend: Arc<dyn Hypervisor>) -> Self {
        Self { backend }
    }

    /// Open a connection to the hypervisor at `uri`.
    #[instrument(skip_all, fields(uri = %uri, backend = ?kind))]
    pub async fn connect(kind: BackendKind, uri: &str) -> Result<Self> {
        let backend: Arc<dyn Hypervisor> = match kind {
            BackendKind::Mock => Arc::new(MockBackend::new()),
            #[cfg(feature = "libvirt")]
            BackendKind::Libvirt => Arc::new(crate::libvirt::LibvirtBackend::new(uri).await?),
            #[cfg(not(feature = "libvirt"))]
            BackendKind::Libvirt => {
                return Err(HypervisorError::ConnectionFailed(format!(
                    "{}: built without libvirt support",
                    uri
                )))
            }
        };
        info!("Connected to hypervisor");
        Ok(Self::new(backend))
    }

    /// URI of the underlying connection.
    pub fn uri(&self) -> &str {
        self.backend.uri()
    }

    /// Release the connection. Native failures are logged, never returned.
    pub async fn close(&self) {
        if let Err(e) = self.backend.close().await {
            warn!(uri = %self.backend.uri(), error = %e, "Failed to close hypervisor connection");
        }
    }

    // =========================================================================
    // Networks
    // =========================================================================

    /// Every network that could be read; unreadable ones are skipped.
    pub async fn list_networks(&self) -> Result<Listing<Network>> {
        let raw = self
            .backend
            .list_networks()
            .await
            .map_err(|e| list_failed(ResourceKind::Network, e))?;

        let mut listing = Listing::new();
        for item in raw {
            match item.map(|x| xml::decode_network(&x)) {
                Ok(Ok(net)) => listing.items.push(net),
                Ok(Err(e)) => skip(&mut listing, ResourceKind::Network, e),
                Err(e) => skip_native(&mut listing, ResourceKind::Network, e),
            }
        }
        Ok(listing)
    }

    /// A network by name.
    pub async fn lookup_network(&self, name: &str) -> Result<Network> {
        let raw = self
            .backend
            .network_xml(name)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Network, name, e))?;
        xml::decode_network(&raw)
    }

    // =========================================================================
    // Domains
    // =========================================================================

    /// Every domain that could be read, with its live status.
    ///
    /// A domain whose status cannot be read is skipped like an undecodable
    /// one.
    pub async fn list_domains(&self) -> Result<Listing<Domain>> {
        let raw = self
            .backend
            .list_domains()
            .await
            .map_err(|e| list_failed(ResourceKind::Domain, e))?;

        let mut listing = Listing::new();
        for item in raw {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    skip_native(&mut listing, ResourceKind::Domain, e);
                    continue;
                }
            };
            match (xml::decode_domain(&raw.xml), raw.active) {
                (Ok(mut dom), Ok(active)) => {
                    dom.active = active;
                    listing.items.push(dom);
                }
                (Ok(dom), Err(e)) => {
                    let e = HypervisorError::from_lookup(ResourceKind::Domain, &dom.name, e);
                    skip(&mut listing, ResourceKind::Domain, e);
                }
                (Err(e), _) => skip(&mut listing, ResourceKind::Domain, e),
            }
        }
        Ok(listing)
    }

    /// The domains with at least one interface on `network`. Each domain
    /// appears once.
    pub async fn list_domains_by_network(&self, network: &Network) -> Result<Listing<Domain>> {
        Ok(self
            .list_domains()
            .await?
            .filter(|dom| dom.is_attached_to(&network.name)))
    }

    /// A domain by name, with its live status.
    pub async fn lookup_domain(&self, name: &str) -> Result<Domain> {
        let raw = self
            .backend
            .domain_xml(name)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Domain, name, e))?;
        let mut dom = xml::decode_domain(&raw)?;
        dom.active = self.domain_is_active(name).await?;
        Ok(dom)
    }

    /// Live status of a domain.
    pub async fn domain_is_active(&self, name: &str) -> Result<bool> {
        self.backend
            .domain_is_active(name)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Domain, name, e))
    }

    /// Request a start of a domain.
    #[instrument(skip(self))]
    pub async fn start_domain(&self, name: &str) -> Result<()> {
        self.backend
            .start_domain(name)
            .await
            .map_err(|e| control_failed("start", name, e))?;
        debug!("Start requested");
        Ok(())
    }

    /// Request a graceful shutdown of a domain. Completion is not awaited.
    #[instrument(skip(self))]
    pub async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.backend
            .shutdown_domain(name)
            .await
            .map_err(|e| control_failed("shutdown", name, e))?;
        debug!("Shutdown requested");
        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Every storage pool that could be read.
    pub async fn list_pools(&self) -> Result<Listing<StoragePool>> {
        let raw = self
            .backend
            .list_pools()
            .await
            .map_err(|e| list_failed(ResourceKind::Pool, e))?;

        let mut listing = Listing::new();
        for item in raw {
            match item.map(|x| xml::decode_pool(&x)) {
                Ok(Ok(pool)) => listing.items.push(pool),
                Ok(Err(e)) => skip(&mut listing, ResourceKind::Pool, e),
                Err(e) => skip_native(&mut listing, ResourceKind::Pool, e),
            }
        }
        Ok(listing)
    }

    /// A storage pool by name.
    pub async fn lookup_pool(&self, name: &str) -> Result<StoragePool> {
        let raw = self
            .backend
            .pool_xml(name)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Pool, name, e))?;
        xml::decode_pool(&raw)
    }

    /// Every volume of a pool that could be read.
    pub async fn list_volumes(&self, pool: &str) -> Result<Listing<Volume>> {
        let raw = self
            .backend
            .list_volumes(pool)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Pool, pool, e))?;

        let mut listing = Listing::new();
        for item in raw {
            match item.map(|x| xml::decode_volume(&x)) {
                Ok(Ok(vol)) => listing.items.push(vol),
                Ok(Err(e)) => skip(&mut listing, ResourceKind::Volume, e),
                Err(e) => skip_native(&mut listing, ResourceKind::Volume, e),
            }
        }
        Ok(listing)
    }

    /// A volume by pool and name.
    pub async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Volume> {
        let raw = self
            .backend
            .volume_xml(pool, name)
            .await
            .map_err(|e| lookup_volume_failed(pool, name, e))?;
        xml::decode_volume(&raw)
    }

    /// A volume by its path on the hypervisor.
    pub async fn lookup_volume_by_path(&self, path: &str) -> Result<Volume> {
        let raw = self
            .backend
            .volume_xml_by_path(path)
            .await
            .map_err(|e| HypervisorError::from_lookup(ResourceKind::Volume, path, e))?;
        xml::decode_volume(&raw)
    }

    /// Whether a volume exists in a pool.
    ///
    /// Only the absence of the volume gives `false`: a missing pool or any
    /// other failure is an error.
    pub async fn volume_exists(&self, pool: &str, name: &str) -> Result<bool> {
        match self.backend.volume_xml(pool, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found(ResourceKind::Volume) => Ok(false),
            Err(e) => Err(lookup_volume_failed(pool, name, e)),
        }
    }

    /// Define an empty volume of `capacity` bytes. An empty `format` means
    /// the default format.
    #[instrument(skip(self))]
    pub async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        capacity: u64,
        format: &str,
    ) -> Result<Volume> {
        let mut builder = xml::VolumeXmlBuilder::new(name, capacity);
        if !format.is_empty() {
            builder = builder.with_format(format);
        }
        let definition = builder.build();
        let raw = self
            .backend
            .create_volume(pool, &definition)
            .await
            .map_err(|source| HypervisorError::CreateFailed {
                kind: ResourceKind::Volume,
                name: format!("{}/{}", pool, name),
                source,
            })?;
        info!("Volume created");
        xml::decode_volume(&raw)
    }

    /// Delete a volume. An already absent volume is reported as
    /// [`HypervisorError::NotFound`].
    #[instrument(skip(self))]
    pub async fn remove_volume(&self, pool: &str, name: &str) -> Result<()> {
        match self.backend.delete_volume(pool, name).await {
            Ok(()) => {
                info!("Volume removed");
                Ok(())
            }
            Err(BackendError::NotFound { kind, name }) => Err(HypervisorError::NotFound { kind, name }),
            Err(source) => Err(HypervisorError::RemoveFailed {
                kind: ResourceKind::Volume,
                name: format!("{}/{}", pool, name),
                source,
            }),
        }
    }

    /// Open an upload stream into an existing volume.
    pub async fn open_upload(
        &self,
        pool: &str,
        name: &str,
        length: u64,
    ) -> std::result::Result<Box<dyn UploadStream>, BackendError> {
        self.backend.open_upload(pool, name, length).await
    }
}

fn list_failed(kind: ResourceKind, source: BackendError) -> HypervisorError {
    HypervisorError::QueryFailed {
        kind,
        name: "*".to_string(),
        source,
    }
}

fn lookup_volume_failed(pool: &str, name: &str, err: BackendError) -> HypervisorError {
    match err {
        BackendError::NotFound { kind, name } => HypervisorError::NotFound { kind, name },
        source => HypervisorError::QueryFailed {
            kind: ResourceKind::Volume,
            name: format!("{}/{}", pool, name),
            source,
        },
    }
}

fn control_failed(action: &'static str, name: &str, err: BackendError) -> HypervisorError {
    match err {
        BackendError::NotFound { kind, name } => HypervisorError::NotFound { kind, name },
        source => HypervisorError::ControlFailed {
            action,
            name: name.to_string(),
            source,
        },
    }
}

fn skip<T>(listing: &mut Listing<T>, kind: ResourceKind, error: HypervisorError) {
    warn!(kind = %kind, error = %error, "Skipping unreadable item");
    listing.skip(kind, error);
}

fn skip_native<T>(listing: &mut Listing<T>, kind: ResourceKind, error: BackendError) {
    warn!(kind = %kind, error = %error, "Skipping unreadable item");
    listing.skip_native(kind, error);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Arc<MockBackend>, HypervisorClient) {
        let mock = Arc::new(MockBackend::new());
        let client = HypervisorClient::new(mock.clone());
        (mock, client)
    }

    #[tokio::test]
    async fn test_volume_exists_distinguishes_missing_pool() {
        let (mock, client) = client();
        mock.add_pool("default", "/images");
        mock.add_volume("default", "a.qcow2", 10);

        assert!(client.volume_exists("default", "a.qcow2").await.unwrap());
        assert!(!client.volume_exists("default", "b.qcow2").await.unwrap());

        let err = client.volume_exists("nope", "a.qcow2").await.unwrap_err();
        assert!(matches!(
            err,
            HypervisorError::NotFound {
                kind: ResourceKind::Pool,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_volume_exists_reports_lookup_failure() {
        let (mock, client) = client();
        mock.add_pool("default", "/images");
        mock.add_volume("default", "a.qcow2", 10);
        mock.fail_volume_lookup("default", "b.qcow2", BackendError::Failed("rpc".to_string()));

        assert!(client.volume_exists("default", "a.qcow2").await.unwrap());
        let err = client.volume_exists("default", "b.qcow2").await.unwrap_err();
        match err {
            HypervisorError::QueryFailed { kind, name, source } => {
                assert_eq!(kind, ResourceKind::Volume);
                assert_eq!(name, "default/b.qcow2");
                assert_eq!(source, BackendError::Failed("rpc".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_storage_listing() {
        let (mock, client) = client();
        mock.add_pool("default", "/images");
        mock.add_pool("fast", "/ssd");
        mock.add_volume("default", "a.qcow2", 10);
        mock.add_volume_xml("default", "b.qcow2", "<volume><name>b.qcow2");

        let pools = client.list_pools().await.unwrap().into_items();
        let names: Vec<&str> = pools.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["default", "fast"]);
        assert_eq!(client.lookup_pool("fast").await.unwrap().path, "/ssd");

        let volumes = client.list_volumes("default").await.unwrap();
        assert_eq!(volumes.items.len(), 1);
        assert_eq!(volumes.skipped.len(), 1);

        let vol = client.lookup_volume_by_path("/images/a.qcow2").await.unwrap();
        assert_eq!(vol.name, "a.qcow2");
        assert_eq!(vol.capacity, 10);
        assert!(client.lookup_volume_by_path("/ssd/a.qcow2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_volume() {
        let (mock, client) = client();
        mock.add_pool("default", "/images");

        let vol = client.create_volume("default", "new.qcow2", 4096, "").await.unwrap();
        assert_eq!(vol.capacity, 4096);
        assert_eq!(vol.path, "/images/new.qcow2");
        assert_eq!(vol.format, "qcow2");

        let err = client.create_volume("default", "new.qcow2", 4096, "").await.unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed { .. }));

        let vol = client.create_volume("default", "new.raw", 4096, "raw").await.unwrap();
        assert_eq!(vol.format, "raw");
    }

    #[tokio::test]
    async fn test_remove_missing_volume_is_not_found() {
        let (mock, client) = client();
        mock.add_pool("default", "/images");

        let err = client.remove_volume("default", "gone.qcow2").await.unwrap_err();
        assert!(err.is_not_found());

        mock.add_volume("default", "x.qcow2", 1);
        mock.fail_delete(BackendError::Failed("busy".to_string()));
        let err = client.remove_volume("default", "x.qcow2").await.unwrap_err();
        assert!(matches!(err, HypervisorError::RemoveFailed { .. }));
    }

    #[tokio::test]
    async fn test_start_failure_keeps_cause() {
        let (mock, client) = client();
        mock.add_domain_xml("vm1", "<domain><name>vm1</name></domain>", false);
        mock.fail_start("vm1", BackendError::Failed("no memory".to_string()));

        let err = client.start_domain("vm1").await.unwrap_err();
        match err {
            HypervisorError::ControlFailed { action, name, source } => {
                assert_eq!(action, "start");
                assert_eq!(name, "vm1");
                assert_eq!(source, BackendError::Failed("no memory".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    const NET: &str = "<network><name>lab</name><ip address='10.0.10.1' prefix='24'/></network>";

    fn domain_on(name: &str, networks: &[&str]) -> String {
        let ifaces: String = networks
            .iter()
            .map(|n| format!("<interface type='network'><source network='{n}'/></interface>"))
            .collect();
        format!("<domain type='kvm'><name>{name}</name><devices>{ifaces}</devices></domain>")
    }

    #[tokio::test]
    async fn test_malformed_items_are_skipped() {
        let (mock, client) = client();
        mock.add_network_xml("lab", NET);
        mock.add_network_xml("broken", "<network><name>broken</network>");
        mock.fail_network_descriptor("gone", BackendError::Failed("vanished".to_string()));
        mock.add_network_xml("gone", NET);

        let listing = client.list_networks().await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "lab");
        assert_eq!(listing.skipped.len(), 2);
        assert!(!listing.is_complete());
    }

    #[tokio::test]
    async fn test_domain_with_unreadable_status_is_skipped() {
        let (mock, client) = client();
        mock.add_domain_xml("vm1", &domain_on("vm1", &["lab"]), true);
        mock.add_domain_xml("vm2", &domain_on("vm2", &["lab"]), true);
        mock.fail_domain_status("vm2", BackendError::Failed("rpc".to_string()));

        let listing = client.list_domains().await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert!(listing.items[0].active);
        assert_eq!(listing.skipped.len(), 1);
        assert_eq!(listing.skipped[0].kind, ResourceKind::Domain);
    }

    #[tokio::test]
    async fn test_domains_by_network_are_unique() {
        let (mock, client) = client();
        mock.add_network_xml("lab", NET);
        mock.add_domain_xml("db1", &domain_on("db1", &["lab", "lab"]), false);
        mock.add_domain_xml("web1", &domain_on("web1", &["default", "lab"]), true);
        mock.add_domain_xml("other", &domain_on("other", &["default"]), true);

        let net = client.lookup_network("lab").await.unwrap();
        let names: Vec<String> = client
            .list_domains_by_network(&net)
            .await
            .unwrap()
            .into_items()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["db1", "web1"]);
    }

    #[tokio::test]
    async fn test_lookup_domain_reads_status() {
        let (mock, client) = client();
        mock.add_domain_xml("vm1", &domain_on("vm1", &["lab"]), true);

        let dom = client.lookup_domain("vm1").await.unwrap();
        assert!(dom.active);
        assert!(dom.is_attached_to("lab"));
        assert!(client.lookup_domain("vm2").await.unwrap_err().is_not_found());

        mock.fail_domain_status("vm1", BackendError::Failed("rpc".to_string()));
        let err = client.lookup_domain("vm1").await.unwrap_err();
        assert!(matches!(err, HypervisorError::QueryFailed { .. }));
    }

    #[tokio::test]
    async fn test_lookup_missing_network() {
        let (_mock, client) = client();
        let err = client.lookup_network("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_connect_mock() {
        let client = HypervisorClient::connect(BackendKind::Mock, "mock:///default")
            .await
            .unwrap();
        assert_eq!(client.list_networks().await.unwrap().items.len(), 0);
        client.close().await;
    }
}
