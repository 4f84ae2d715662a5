//! Libvirt XML descriptors.
//!
//! Decoding goes through private serde mirrors of the libvirt documents, every
//! field defaulted so a partially populated descriptor still decodes, then the
//! mirrors are turned into the owned resource descriptors of [`crate::types`].
//! Encoding is only needed for volume creation and is done with a small
//! string builder.

use quick_xml::escape::escape;
use serde::Deserialize;

use crate::error::{HypervisorError, ResourceKind, Result};
use crate::types::*;

fn decode<'de, T: Deserialize<'de>>(kind: ResourceKind, xml: &'de str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| HypervisorError::DecodeFailed {
        kind,
        message: e.to_string(),
    })
}

/// Scale a libvirt scaled integer to bytes.
fn scale_to_bytes(value: u64, unit: Option<&str>) -> u64 {
    let factor: u64 = match unit.unwrap_or("bytes") {
        "b" | "bytes" | "B" => 1,
        "KB" => 1_000,
        "k" | "K" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "m" | "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "g" | "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "t" | "T" | "TiB" => 1 << 40,
        _ => 1,
    };
    value.saturating_mul(factor)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// =============================================================================
// SHARED MIRRORS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawScaled {
    #[serde(rename = "@unit")]
    unit: Option<String>,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFormat {
    #[serde(rename = "@type")]
    format_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPath {
    path: String,
}

// =============================================================================
// NETWORK
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNetwork {
    name: String,
    uuid: String,
    #[serde(rename = "ip")]
    ips: Vec<RawIp>,
    dns: RawDns,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIp {
    #[serde(rename = "@family")]
    family: Option<String>,
    #[serde(rename = "@address")]
    address: String,
    #[serde(rename = "@prefix")]
    prefix: Option<u8>,
    #[serde(rename = "@netmask")]
    netmask: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDns {
    #[serde(rename = "host")]
    hosts: Vec<RawDnsHost>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDnsHost {
    #[serde(rename = "@ip")]
    ip: String,
    #[serde(rename = "hostname")]
    hostnames: Vec<String>,
}

/// Decode a `<network>` descriptor.
pub fn decode_network(xml: &str) -> Result<Network> {
    let raw: RawNetwork = decode(ResourceKind::Network, xml)?;

    // The bridge address is the first IPv4 block when there is one.
    let ip = raw
        .ips
        .iter()
        .find(|ip| ip.family.as_deref().unwrap_or("ipv4") == "ipv4")
        .or_else(|| raw.ips.first());

    let address = ip
        .map(|ip| BridgeAddress {
            family: ip.family.clone().unwrap_or_else(|| "ipv4".to_string()),
            address: ip.address.clone(),
            prefix: ip.prefix,
            netmask: non_empty(ip.netmask.clone()),
        })
        .unwrap_or_default();

    Ok(Network {
        name: raw.name,
        uuid: raw.uuid,
        address,
        hosts: raw
            .dns
            .hosts
            .into_iter()
            .map(|h| DnsHost {
                address: h.ip,
                hostnames: h.hostnames,
            })
            .collect(),
    })
}

// =============================================================================
// DOMAIN
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDomain {
    #[serde(rename = "@type")]
    domain_type: String,
    name: String,
    uuid: String,
    memory: RawScaled,
    vcpu: RawVcpu,
    devices: RawDevices,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVcpu {
    #[serde(rename = "$text")]
    count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDevices {
    #[serde(rename = "disk")]
    disks: Vec<RawDisk>,
    #[serde(rename = "interface")]
    interfaces: Vec<RawInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDisk {
    #[serde(rename = "@type")]
    disk_type: String,
    #[serde(rename = "@device")]
    device: String,
    source: Option<RawSource>,
    target: RawTarget,
    #[serde(rename = "backingStore")]
    backing_store: Option<RawBackingStore>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBackingStore {
    source: Option<RawSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSource {
    #[serde(rename = "@pool")]
    pool: Option<String>,
    #[serde(rename = "@volume")]
    volume: Option<String>,
    #[serde(rename = "@file")]
    file: Option<String>,
    #[serde(rename = "@network")]
    network: Option<String>,
    #[serde(rename = "@bridge")]
    bridge: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTarget {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInterface {
    #[serde(rename = "@type")]
    iface_type: String,
    mac: RawMac,
    source: RawSource,
    target: RawTarget,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMac {
    #[serde(rename = "@address")]
    address: String,
}

impl From<RawDisk> for Disk {
    fn from(raw: RawDisk) -> Self {
        let source = match raw.source {
            Some(RawSource {
                pool: Some(pool),
                volume: Some(volume),
                ..
            }) => DiskSource::Volume { pool, volume },
            Some(RawSource { file: Some(path), .. }) => DiskSource::File { path },
            _ => DiskSource::None,
        };

        Disk {
            disk_type: raw.disk_type,
            device: raw.device,
            target: DiskTarget {
                dev: raw.target.dev,
                bus: raw.target.bus,
            },
            source,
            backing_file: raw
                .backing_store
                .and_then(|b| b.source)
                .and_then(|s| non_empty(s.file)),
        }
    }
}

impl From<RawInterface> for Interface {
    fn from(raw: RawInterface) -> Self {
        Interface {
            iface_type: raw.iface_type,
            mac: raw.mac.address,
            source: InterfaceSource {
                network: non_empty(raw.source.network),
                bridge: non_empty(raw.source.bridge),
            },
            target: raw.target.dev,
        }
    }
}

/// Decode a `<domain>` descriptor. The `active` flag is left to `false`, it
/// is not part of the descriptor.
pub fn decode_domain(xml: &str) -> Result<Domain> {
    let raw: RawDomain = decode(ResourceKind::Domain, xml)?;

    Ok(Domain {
        name: raw.name,
        uuid: raw.uuid,
        domain_type: raw.domain_type,
        vcpu: raw.vcpu.count,
        memory: Memory {
            size: raw.memory.value,
            unit: raw.memory.unit.unwrap_or_else(|| "KiB".to_string()),
        },
        disks: raw.devices.disks.into_iter().map(Disk::from).collect(),
        interfaces: raw.devices.interfaces.into_iter().map(Interface::from).collect(),
        active: false,
    })
}

// =============================================================================
// STORAGE
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPool {
    #[serde(rename = "@type")]
    pool_type: String,
    name: String,
    uuid: String,
    target: RawPoolTarget,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPoolTarget {
    path: String,
    permissions: RawPermissions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPermissions {
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
}

/// Decode a `<pool>` descriptor.
pub fn decode_pool(xml: &str) -> Result<StoragePool> {
    let raw: RawPool = decode(ResourceKind::Pool, xml)?;
    let perms = raw.target.permissions;

    // libvirt reports -1 for an unset owner or group
    let id = |v: Option<String>| v.and_then(|v| v.trim().parse::<u32>().ok());

    Ok(StoragePool {
        name: raw.name,
        uuid: raw.uuid,
        pool_type: raw.pool_type,
        path: raw.target.path,
        permissions: Permissions {
            mode: perms
                .mode
                .and_then(|m| u32::from_str_radix(m.trim(), 8).ok()),
            owner: id(perms.owner),
            group: id(perms.group),
        },
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVolume {
    #[serde(rename = "@type")]
    volume_type: String,
    name: String,
    key: String,
    capacity: RawScaled,
    allocation: Option<RawScaled>,
    physical: Option<RawScaled>,
    target: RawVolumeTarget,
    #[serde(rename = "backingStore")]
    backing_store: Option<RawPath>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVolumeTarget {
    path: String,
    format: RawFormat,
}

/// Decode a `<volume>` descriptor.
pub fn decode_volume(xml: &str) -> Result<Volume> {
    let raw: RawVolume = decode(ResourceKind::Volume, xml)?;

    let size = raw
        .physical
        .or(raw.allocation)
        .map(|s| scale_to_bytes(s.value, s.unit.as_deref()))
        .unwrap_or(0);

    Ok(Volume {
        name: raw.name,
        volume_type: raw.volume_type,
        key: raw.key,
        capacity: scale_to_bytes(raw.capacity.value, raw.capacity.unit.as_deref()),
        size,
        path: raw.target.path,
        format: raw.target.format.format_type,
        backing_store: raw.backing_store.and_then(|b| non_empty(Some(b.path))),
    })
}

// =============================================================================
// ENCODING
// =============================================================================

/// Builder for the XML definition of a new volume.
pub struct VolumeXmlBuilder<'a> {
    name: &'a str,
    capacity: u64,
    format: &'a str,
}

impl<'a> VolumeXmlBuilder<'a> {
    pub fn new(name: &'a str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            format: DEFAULT_VOLUME_FORMAT,
        }
    }

    pub fn with_format(mut self, format: &'a str) -> Self {
        self.format = format;
        self
    }

    pub fn build(&self) -> String {
        format!(
            r#"<volume type='file'>
  <name>{}</name>
  <capacity unit='bytes'>{}</capacity>
  <target>
    <format type='{}'/>
  </target>
</volume>
"#,
            escape(self.name),
            self.capacity,
            escape(self.format)
        )
    }
}
