//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use crate::error::{BackendError, BackendResult, ResourceKind};
use crate::traits::{Hypervisor, RawDomain, UploadStream};
use crate::types::DEFAULT_VOLUME_FORMAT;
use crate::xml;

/// Mock hypervisor backend for testing.
///
/// Objects are kept in memory as XML descriptors, the way libvirt hands them
/// out. Failures can be injected per object or per operation, and the control
/// requests and uploaded bytes are recorded for inspection.
pub struct MockBackend {
    uri: String,
    state: Arc<RwLock<MockState>>,
}

#[derive(Default)]
struct MockState {
    closed: bool,
    networks: BTreeMap<String, String>,
    domains: BTreeMap<String, MockDomain>,
    pools: BTreeMap<String, MockPool>,
    start_requests: Vec<String>,
    shutdown_requests: Vec<String>,
    failures: Failures,
}

struct MockDomain {
    xml: String,
    active: bool,
}

struct MockPool {
    xml: String,
    path: String,
    volumes: BTreeMap<String, MockVolume>,
}

struct MockVolume {
    /// Descriptor given by the test, rendered from the fields otherwise
    raw: Option<String>,
    capacity: u64,
    format: String,
    received: u64,
    finished: bool,
    aborted: bool,
}

#[derive(Default)]
struct Failures {
    network_descriptor: BTreeMap<String, BackendError>,
    domain_descriptor: BTreeMap<String, BackendError>,
    domain_status: BTreeMap<String, BackendError>,
    start: BTreeMap<String, BackendError>,
    shutdown: BTreeMap<String, BackendError>,
    volume_lookup: BTreeMap<(String, String), BackendError>,
    create: Option<BackendError>,
    delete: Option<BackendError>,
    send_after: Option<(u64, BackendError)>,
    finish: Option<BackendError>,
    abort: Option<BackendError>,
    send_limit: Option<usize>,
}

fn poisoned<T>(_: T) -> BackendError {
    BackendError::Failed("lock poisoned".to_string())
}

fn render_volume(name: &str, path: &str, volume: &MockVolume) -> String {
    format!(
        r#"<volume type='file'>
  <name>{name}</name>
  <key>{path}</key>
  <capacity unit='bytes'>{}</capacity>
  <allocation unit='bytes'>{}</allocation>
  <target>
    <path>{path}</path>
    <format type='{}'/>
  </target>
</volume>"#,
        volume.capacity, volume.received, volume.format
    )
}

impl MockBackend {
    /// Create a new, empty mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            uri: "mock:///default".to_string(),
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    fn read(&self) -> BackendResult<RwLockReadGuard<'_, MockState>> {
        let state = self.state.read().map_err(poisoned)?;
        if state.closed {
            return Err(BackendError::Failed("connection is closed".to_string()));
        }
        Ok(state)
    }

    fn write(&self) -> BackendResult<RwLockWriteGuard<'_, MockState>> {
        let state = self.state.write().map_err(poisoned)?;
        if state.closed {
            return Err(BackendError::Failed("connection is closed".to_string()));
        }
        Ok(state)
    }

    fn setup(&self, f: impl FnOnce(&mut MockState)) {
        if let Ok(mut state) = self.state.write() {
            f(&mut state);
        }
    }

    fn inspect<T: Default>(&self, f: impl FnOnce(&MockState) -> T) -> T {
        self.state.read().map(|s| f(&s)).unwrap_or_default()
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// Register a network from its descriptor.
    pub fn add_network_xml(&self, name: &str, xml: &str) {
        self.setup(|s| {
            s.networks.insert(name.to_string(), xml.to_string());
        });
    }

    /// Register a domain from its descriptor, with its live status.
    pub fn add_domain_xml(&self, name: &str, xml: &str, active: bool) {
        self.setup(|s| {
            s.domains.insert(
                name.to_string(),
                MockDomain {
                    xml: xml.to_string(),
                    active,
                },
            );
        });
    }

    /// Register a directory pool rooted at `path`.
    pub fn add_pool(&self, name: &str, path: &str) {
        let xml = format!(
            "<pool type='dir'><name>{name}</name><target><path>{path}</path></target></pool>"
        );
        self.add_pool_xml(name, &xml);
    }

    /// Register a pool from its descriptor.
    pub fn add_pool_xml(&self, name: &str, xml: &str) {
        let path = xml::decode_pool(xml).map(|p| p.path).unwrap_or_default();
        self.setup(|s| {
            s.pools.insert(
                name.to_string(),
                MockPool {
                    xml: xml.to_string(),
                    path,
                    volumes: BTreeMap::new(),
                },
            );
        });
    }

    /// Register a qcow2 volume of `capacity` bytes in an existing pool.
    pub fn add_volume(&self, pool: &str, name: &str, capacity: u64) {
        self.insert_volume(pool, name, None, capacity);
    }

    /// Register a volume from its descriptor in an existing pool.
    pub fn add_volume_xml(&self, pool: &str, name: &str, xml: &str) {
        self.insert_volume(pool, name, Some(xml.to_string()), 0);
    }

    fn insert_volume(&self, pool: &str, name: &str, raw: Option<String>, capacity: u64) {
        self.setup(|s| {
            if let Some(p) = s.pools.get_mut(pool) {
                p.volumes.insert(
                    name.to_string(),
                    MockVolume {
                        raw,
                        capacity,
                        format: DEFAULT_VOLUME_FORMAT.to_string(),
                        received: 0,
                        finished: true,
                        aborted: false,
                    },
                );
            }
        });
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make the descriptor read of a network fail.
    pub fn fail_network_descriptor(&self, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures.network_descriptor.insert(name.to_string(), err);
        });
    }

    /// Make the descriptor read of a domain fail.
    pub fn fail_domain_descriptor(&self, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures.domain_descriptor.insert(name.to_string(), err);
        });
    }

    /// Make the status read of a domain fail.
    pub fn fail_domain_status(&self, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures.domain_status.insert(name.to_string(), err);
        });
    }

    /// Refuse start requests for a domain.
    pub fn fail_start(&self, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures.start.insert(name.to_string(), err);
        });
    }

    /// Refuse shutdown requests for a domain.
    pub fn fail_shutdown(&self, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures.shutdown.insert(name.to_string(), err);
        });
    }

    /// Make the descriptor read of a volume fail. The volume need not exist.
    pub fn fail_volume_lookup(&self, pool: &str, name: &str, err: BackendError) {
        self.setup(|s| {
            s.failures
                .volume_lookup
                .insert((pool.to_string(), name.to_string()), err);
        });
    }

    /// Make volume creation fail.
    pub fn fail_create(&self, err: BackendError) {
        self.setup(|s| s.failures.create = Some(err));
    }

    /// Make volume deletion fail.
    pub fn fail_delete(&self, err: BackendError) {
        self.setup(|s| s.failures.delete = Some(err));
    }

    /// Make sends fail once `after` bytes were accepted.
    pub fn fail_send_after(&self, after: u64, err: BackendError) {
        self.setup(|s| s.failures.send_after = Some((after, err)));
    }

    /// Make stream finalization fail.
    pub fn fail_finish(&self, err: BackendError) {
        self.setup(|s| s.failures.finish = Some(err));
    }

    /// Make stream abort fail.
    pub fn fail_abort(&self, err: BackendError) {
        self.setup(|s| s.failures.abort = Some(err));
    }

    /// Accept at most `limit` bytes per send, forcing short writes.
    pub fn limit_send(&self, limit: usize) {
        self.setup(|s| s.failures.send_limit = Some(limit));
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Domains a start was requested for, in order.
    pub fn start_requests(&self) -> Vec<String> {
        self.inspect(|s| s.start_requests.clone())
    }

    /// Domains a shutdown was requested for, in order.
    pub fn shutdown_requests(&self) -> Vec<String> {
        self.inspect(|s| s.shutdown_requests.clone())
    }

    /// Bytes received by the upload streams of a volume.
    pub fn bytes_received(&self, pool: &str, name: &str) -> u64 {
        self.inspect(|s| {
            s.pools
                .get(pool)
                .and_then(|p| p.volumes.get(name))
                .map(|v| v.received)
                .unwrap_or(0)
        })
    }

    /// Whether the last upload into a volume was aborted.
    pub fn upload_aborted(&self, pool: &str, name: &str) -> bool {
        self.inspect(|s| {
            s.pools
                .get(pool)
                .and_then(|p| p.volumes.get(name))
                .map(|v| v.aborted)
                .unwrap_or(false)
        })
    }

    /// Whether the last upload into a volume was finalized.
    pub fn upload_finished(&self, pool: &str, name: &str) -> bool {
        self.inspect(|s| {
            s.pools
                .get(pool)
                .and_then(|p| p.volumes.get(name))
                .map(|v| v.finished)
                .unwrap_or(false)
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inspect(|s| s.closed)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn pool(&self, name: &str) -> BackendResult<&MockPool> {
        self.pools
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Pool, name))
    }

    fn domain(&self, name: &str) -> BackendResult<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Domain, name))
    }

    fn domain_xml(&self, name: &str) -> BackendResult<String> {
        let domain = self.domain(name)?;
        match self.failures.domain_descriptor.get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(domain.xml.clone()),
        }
    }

    fn domain_status(&self, name: &str) -> BackendResult<bool> {
        let domain = self.domain(name)?;
        match self.failures.domain_status.get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(domain.active),
        }
    }

    fn network_xml(&self, name: &str) -> BackendResult<String> {
        let xml = self
            .networks
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Network, name))?;
        match self.failures.network_descriptor.get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(xml.clone()),
        }
    }

    fn volume_xml(&self, pool: &str, name: &str) -> BackendResult<String> {
        let p = self.pool(pool)?;
        if let Some(err) = self
            .failures
            .volume_lookup
            .get(&(pool.to_string(), name.to_string()))
        {
            return Err(err.clone());
        }
        let volume = p
            .volumes
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Volume, name))?;
        Ok(volume
            .raw
            .clone()
            .unwrap_or_else(|| render_volume(name, &format!("{}/{}", p.path, name), volume)))
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn close(&self) -> BackendResult<()> {
        let mut state = self.write()?;
        state.closed = true;
        debug!("Mock connection closed");
        Ok(())
    }

    async fn list_networks(&self) -> BackendResult<Vec<BackendResult<String>>> {
        let state = self.read()?;
        Ok(state.networks.keys().map(|n| state.network_xml(n)).collect())
    }

    async fn network_xml(&self, name: &str) -> BackendResult<String> {
        self.read()?.network_xml(name)
    }

    async fn list_domains(&self) -> BackendResult<Vec<BackendResult<RawDomain>>> {
        let state = self.read()?;
        Ok(state
            .domains
            .keys()
            .map(|name| {
                state.domain_xml(name).map(|xml| RawDomain {
                    xml,
                    active: state.domain_status(name),
                })
            })
            .collect())
    }

    async fn domain_xml(&self, name: &str) -> BackendResult<String> {
        self.read()?.domain_xml(name)
    }

    async fn domain_is_active(&self, name: &str) -> BackendResult<bool> {
        self.read()?.domain_status(name)
    }

    #[instrument(skip(self))]
    async fn start_domain(&self, name: &str) -> BackendResult<()> {
        let mut state = self.write()?;
        state.domain(name)?;
        if let Some(err) = state.failures.start.get(name) {
            return Err(err.clone());
        }
        state.start_requests.push(name.to_string());
        if let Some(domain) = state.domains.get_mut(name) {
            domain.active = true;
        }
        debug!("Mock domain started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_domain(&self, name: &str) -> BackendResult<()> {
        let mut state = self.write()?;
        state.domain(name)?;
        if let Some(err) = state.failures.shutdown.get(name) {
            return Err(err.clone());
        }
        state.shutdown_requests.push(name.to_string());
        if let Some(domain) = state.domains.get_mut(name) {
            domain.active = false;
        }
        debug!("Mock domain shut down");
        Ok(())
    }

    async fn list_pools(&self) -> BackendResult<Vec<BackendResult<String>>> {
        let state = self.read()?;
        Ok(state.pools.values().map(|p| Ok(p.xml.clone())).collect())
    }

    async fn pool_xml(&self, name: &str) -> BackendResult<String> {
        Ok(self.read()?.pool(name)?.xml.clone())
    }

    async fn list_volumes(&self, pool: &str) -> BackendResult<Vec<BackendResult<String>>> {
        let state = self.read()?;
        let p = state.pool(pool)?;
        Ok(p.volumes.keys().map(|v| state.volume_xml(pool, v)).collect())
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> BackendResult<String> {
        self.read()?.volume_xml(pool, name)
    }

    async fn volume_xml_by_path(&self, path: &str) -> BackendResult<String> {
        let state = self.read()?;
        for (pool_name, pool) in &state.pools {
            for name in pool.volumes.keys() {
                if format!("{}/{}", pool.path, name) == path {
                    return state.volume_xml(pool_name, name);
                }
            }
        }
        Err(BackendError::not_found(ResourceKind::Volume, path))
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> BackendResult<String> {
        let definition =
            xml::decode_volume(xml).map_err(|e| BackendError::Failed(e.to_string()))?;

        let mut state = self.write()?;
        if let Some(err) = &state.failures.create {
            return Err(err.clone());
        }
        let p = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Pool, pool))?;
        if p.volumes.contains_key(&definition.name) {
            return Err(BackendError::Failed(format!(
                "storage volume '{}' exists already",
                definition.name
            )));
        }

        let format = if definition.format.is_empty() {
            DEFAULT_VOLUME_FORMAT.to_string()
        } else {
            definition.format
        };
        p.volumes.insert(
            definition.name.clone(),
            MockVolume {
                raw: None,
                capacity: definition.capacity,
                format,
                received: 0,
                finished: false,
                aborted: false,
            },
        );
        debug!(volume = %definition.name, capacity = definition.capacity, "Mock volume created");

        state.volume_xml(pool, &definition.name)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, pool: &str, name: &str) -> BackendResult<()> {
        let mut state = self.write()?;
        if let Some(err) = &state.failures.delete {
            return Err(err.clone());
        }
        let p = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Pool, pool))?;
        p.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(ResourceKind::Volume, name))
    }

    async fn open_upload(
        &self,
        pool: &str,
        name: &str,
        _length: u64,
    ) -> BackendResult<Box<dyn UploadStream>> {
        let state = self.read()?;
        let p = state.pool(pool)?;
        if !p.volumes.contains_key(name) {
            return Err(BackendError::not_found(ResourceKind::Volume, name));
        }
        Ok(Box::new(MockUpload {
            state: Arc::clone(&self.state),
            pool: pool.to_string(),
            name: name.to_string(),
        }))
    }
}

/// Upload stream writing into the volume record of the mock.
struct MockUpload {
    state: Arc<RwLock<MockState>>,
    pool: String,
    name: String,
}

impl MockUpload {
    fn with_volume<T>(
        &self,
        f: impl FnOnce(&Failures, &mut MockVolume) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut guard = self.state.write().map_err(poisoned)?;
        let state = &mut *guard;
        let volume = state
            .pools
            .get_mut(&self.pool)
            .and_then(|p| p.volumes.get_mut(&self.name))
            .ok_or_else(|| BackendError::not_found(ResourceKind::Volume, self.name.as_str()))?;
        f(&state.failures, volume)
    }
}

#[async_trait]
impl UploadStream for MockUpload {
    async fn send(&mut self, data: &[u8]) -> BackendResult<usize> {
        self.with_volume(|failures, volume| {
            if let Some((after, err)) = &failures.send_after {
                if volume.received >= *after {
                    return Err(err.clone());
                }
            }
            let accepted = failures.send_limit.map_or(data.len(), |l| data.len().min(l));
            volume.received += accepted as u64;
            Ok(accepted)
        })
    }

    async fn finish(&mut self) -> BackendResult<()> {
        self.with_volume(|failures, volume| {
            if let Some(err) = &failures.finish {
                return Err(err.clone());
            }
            volume.finished = true;
            Ok(())
        })
    }

    async fn abort(&mut self) -> BackendResult<()> {
        self.with_volume(|failures, volume| {
            if let Some(err) = &failures.abort {
                return Err(err.clone());
            }
            volume.aborted = true;
            Ok(())
        })
    }
}
