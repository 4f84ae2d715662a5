//! Resource descriptors for hypervisor objects.
//!
//! These are owned, read-only projections of the native descriptors. They are
//! rebuilt on every query and never hold a native handle.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, HypervisorError};

// =============================================================================
// NETWORK
// =============================================================================

/// A virtual network with its bridge address and static DNS entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub uuid: String,
    /// Address of the bridge
    pub address: BridgeAddress,
    /// Static DNS host entries
    pub hosts: Vec<DnsHost>,
}

impl Network {
    /// Resolve a hostname against the static DNS entries of the network.
    pub fn lookup_dns_host(&self, hostname: &str) -> Option<IpAddr> {
        self.hosts
            .iter()
            .find(|h| h.hostnames.iter().any(|n| n == hostname))
            .and_then(|h| h.address.parse().ok())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network: {} {}", self.name, self.uuid)?;
        writeln!(f, "  address: {}", self.address)?;
        writeln!(f, "  hosts:")?;
        for host in &self.hosts {
            writeln!(f, "    {}  {}", host.address, host.hostnames.join(" "))?;
        }
        Ok(())
    }
}

/// Address of a network bridge, with either a prefix length or a netmask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeAddress {
    /// "ipv4" or "ipv6", empty when the descriptor omits it
    pub family: String,
    pub address: String,
    pub prefix: Option<u8>,
    pub netmask: Option<String>,
}

impl BridgeAddress {
    /// Network part of the address in CIDR notation, e.g. `192.168.122.0/24`.
    ///
    /// Returns `None` when the address or the mask cannot be interpreted.
    pub fn network_cidr(&self) -> Option<String> {
        match self.address.parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) => {
                let prefix = match (&self.netmask, self.prefix) {
                    (Some(mask), _) => {
                        let mask: Ipv4Addr = mask.parse().ok()?;
                        u32::from(mask).leading_ones() as u8
                    }
                    (None, Some(prefix)) if prefix <= 32 => prefix,
                    (None, Some(_)) => return None,
                    (None, None) => 32,
                };
                let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
                let network = Ipv4Addr::from(u32::from(addr) & mask);
                Some(format!("{}/{}", network, prefix))
            }
            IpAddr::V6(addr) => {
                let prefix = match self.prefix {
                    Some(prefix) if prefix <= 128 => prefix,
                    Some(_) => return None,
                    None => 128,
                };
                let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
                let network = Ipv6Addr::from(u128::from(addr) & mask);
                Some(format!("{}/{}", network, prefix))
            }
        }
    }
}

impl fmt::Display for BridgeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network_cidr() {
            Some(cidr) => f.write_str(&cidr),
            None => f.write_str(&self.address),
        }
    }
}

/// A static DNS entry of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsHost {
    pub address: String,
    pub hostnames: Vec<String>,
}

// =============================================================================
// DOMAIN
// =============================================================================

/// A virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub uuid: String,
    /// Domain type (kvm, qemu, ...)
    pub domain_type: String,
    pub vcpu: u32,
    pub memory: Memory,
    pub disks: Vec<Disk>,
    pub interfaces: Vec<Interface>,
    /// Live status, fetched separately from the descriptor
    pub active: bool,
}

impl Domain {
    /// True when one of the interfaces is plugged into the named network.
    pub fn is_attached_to(&self, network: &str) -> bool {
        self.interfaces
            .iter()
            .any(|iface| iface.source.network.as_deref() == Some(network))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Domain: {} ({}) {}", self.name, self.domain_type, self.uuid)?;
        writeln!(f, "  cpu: {}, mem: {} {}", self.vcpu, self.memory.size, self.memory.unit)?;
        writeln!(f, "  disks:")?;
        for disk in &self.disks {
            match &disk.source {
                DiskSource::Volume { pool, volume } => writeln!(
                    f,
                    "   - {}: {}/{} - volume: {}::{}",
                    disk.device, disk.target.bus, disk.target.dev, pool, volume
                )?,
                DiskSource::File { path } => writeln!(
                    f,
                    "   - {}: {}/{} - path: {}",
                    disk.device, disk.target.bus, disk.target.dev, path
                )?,
                DiskSource::None => {}
            }
        }
        writeln!(f, "  interfaces:")?;
        for iface in &self.interfaces {
            writeln!(
                f,
                "   - {} {} net: {} bridge: {}",
                iface.target,
                iface.mac,
                iface.source.network.as_deref().unwrap_or(""),
                iface.source.bridge.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Memory allocation as declared by the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub size: u64,
    /// Unit of `size`, libvirt defaults to KiB
    pub unit: String,
}

/// A disk device of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Source type (file, volume, block, ...)
    pub disk_type: String,
    /// Device kind (disk, cdrom, ...)
    pub device: String,
    pub target: DiskTarget,
    pub source: DiskSource,
    /// Path of the first backing file, for layered images
    pub backing_file: Option<String>,
}

/// Bus and device name of a disk as seen by the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTarget {
    pub dev: String,
    pub bus: String,
}

/// Where the data of a disk lives. A disk references either a volume in a
/// pool or a file, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSource {
    Volume { pool: String, volume: String },
    File { path: String },
    #[default]
    None,
}

/// A network interface of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface type (network, bridge, ...)
    pub iface_type: String,
    pub mac: String,
    pub source: InterfaceSource,
    /// Host side device name
    pub target: String,
}

/// What an interface is plugged into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSource {
    pub network: Option<String>,
    pub bridge: Option<String>,
}

/// Live state of a domain as seen by the infrastructure layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    /// Not resolved yet, or the status read failed
    #[default]
    Unknown,
    Active,
    Inactive,
}

impl From<bool> for DomainState {
    fn from(active: bool) -> Self {
        if active {
            DomainState::Active
        } else {
            DomainState::Inactive
        }
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// A storage pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub uuid: String,
    /// Backing type (dir, logical, netfs, ...)
    pub pool_type: String,
    /// Target path on the hypervisor
    pub path: String,
    pub permissions: Permissions,
}

/// Ownership and mode of a pool target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub mode: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
}

/// A volume inside a storage pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub volume_type: String,
    pub key: String,
    /// Logical size in bytes
    pub capacity: u64,
    /// Physical size in bytes
    pub size: u64,
    pub path: String,
    /// Format tag (qcow2, raw, ...)
    pub format: String,
    /// Path of the backing store, for layered volumes
    pub backing_store: Option<String>,
}

/// Format given to volumes created by this layer.
pub const DEFAULT_VOLUME_FORMAT: &str = "qcow2";

// =============================================================================
// LISTINGS
// =============================================================================

/// An item left out of a listing.
#[derive(Debug)]
pub struct SkippedItem {
    pub kind: crate::error::ResourceKind,
    pub error: HypervisorError,
}

/// Result of a best-effort listing: the items that could be read, plus the
/// ones that were skipped and why.
#[derive(Debug)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub skipped: Vec<SkippedItem>,
}

impl<T> Listing<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Keep only the items matching `pred`, retaining the skipped ones.
    pub fn filter<F>(mut self, mut pred: F) -> Self
    where
        F: FnMut(&T) -> bool,
    {
        self.items.retain(|item| pred(item));
        self
    }

    pub(crate) fn skip(&mut self, kind: crate::error::ResourceKind, error: HypervisorError) {
        self.skipped.push(SkippedItem { kind, error });
    }

    pub(crate) fn skip_native(&mut self, kind: crate::error::ResourceKind, error: BackendError) {
        self.skip(
            kind,
            HypervisorError::QueryFailed {
                kind,
                name: String::new(),
                source: error,
            },
        );
    }
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pretty print a size in bytes, e.g. `2.00 MB`.
pub fn size_pretty(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    if size > 1024.0 {
        size /= 1024.0;
        unit = "kB";
        if size > 1024.0 {
            size /= 1024.0;
            unit = "MB";
            if size > 1024.0 {
                size /= 1024.0;
                unit = "GB";
            }
        }
    }
    format!("{:.2} {}", size, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_cidr_from_prefix() {
        let addr = BridgeAddress {
            family: "ipv4".to_string(),
            address: "192.168.122.1".to_string(),
            prefix: Some(24),
            netmask: None,
        };
        assert_eq!(addr.network_cidr().as_deref(), Some("192.168.122.0/24"));
    }

    #[test]
    fn test_network_cidr_from_netmask() {
        let addr = BridgeAddress {
            address: "10.0.10.1".to_string(),
            netmask: Some("255.255.0.0".to_string()),
            ..Default::default()
        };
        assert_eq!(addr.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_network_cidr_ipv6() {
        let addr = BridgeAddress {
            family: "ipv6".to_string(),
            address: "fd00:1::1".to_string(),
            prefix: Some(64),
            netmask: None,
        };
        assert_eq!(addr.network_cidr().as_deref(), Some("fd00:1::/64"));
    }

    #[test]
    fn test_unparsable_address_renders_raw() {
        let addr = BridgeAddress {
            address: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert_eq!(addr.network_cidr(), None);
        assert_eq!(addr.to_string(), "not-an-ip");
    }

    #[test]
    fn test_dns_lookup() {
        let net = Network {
            name: "lab".to_string(),
            hosts: vec![
                DnsHost {
                    address: "10.0.10.11".to_string(),
                    hostnames: vec!["db1".to_string()],
                },
                DnsHost {
                    address: "10.0.10.12".to_string(),
                    hostnames: vec!["web1".to_string(), "www".to_string()],
                },
            ],
            ..Default::default()
        };

        assert_eq!(net.lookup_dns_host("www"), Some("10.0.10.12".parse().unwrap()));
        assert_eq!(net.lookup_dns_host("db1"), Some("10.0.10.11".parse().unwrap()));
        assert_eq!(net.lookup_dns_host("missing"), None);
    }

    #[test]
    fn test_size_pretty() {
        assert_eq!(size_pretty(512), "512.00 B");
        assert_eq!(size_pretty(2048), "2.00 kB");
        assert_eq!(size_pretty(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(size_pretty(2147483648), "2.00 GB");
    }

    #[test]
    fn test_domain_attachment() {
        let dom = Domain {
            name: "vm1".to_string(),
            interfaces: vec![Interface {
                source: InterfaceSource {
                    network: Some("lab".to_string()),
                    bridge: None,
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(dom.is_attached_to("lab"));
        assert!(!dom.is_attached_to("default"));
    }
}
