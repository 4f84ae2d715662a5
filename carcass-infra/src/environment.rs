//! Environments: a named infrastructure presented to the user.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use carcass_hypervisor::{Disk, DiskSource, Domain, HypervisorClient};

use crate::error::InfraError;
use crate::image::parse_volume_name;
use crate::infrastructure::{ControlReport, Infrastructure};

/// Everything needed to run a service spanning several machines. The
/// environment is named after its network.
#[derive(Clone)]
pub struct Environment {
    pub name: String,
    pub description: String,
    /// DNS domain
    pub domain: String,
    pub infra: Infrastructure,
}

impl Environment {
    pub async fn lookup(client: &HypervisorClient, name: &str) -> Result<Self, InfraError> {
        let infra = Infrastructure::lookup(client, name).await?;
        Ok(Self {
            name: name.to_string(),
            description: String::new(),
            domain: name.to_string(),
            infra,
        })
    }

    /// Names of the environments of the hypervisor, one per network.
    pub async fn list_names(client: &HypervisorClient) -> Result<Vec<String>, InfraError> {
        let networks = client.list_networks().await.map_err(InfraError::List)?;
        Ok(networks.into_items().into_iter().map(|n| n.name).collect())
    }

    pub async fn start(&self) -> ControlReport {
        self.infra.start_all().await
    }

    pub async fn stop(&self, force: bool) -> ControlReport {
        self.infra.stop_all(force).await
    }

    /// Address of a machine from the static DNS entries of the network,
    /// the unspecified address when there is none.
    fn machine_address(&self, machine: &Domain) -> IpAddr {
        self.infra
            .network
            .lookup_dns_host(&machine.name)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// Name of the image a machine was built from: the first disk whose volume,
/// file or backing file is a base volume.
pub fn base_image(machine: &Domain) -> Option<&str> {
    machine.disks.iter().find_map(disk_base_image)
}

fn disk_base_image(disk: &Disk) -> Option<&str> {
    let own = match &disk.source {
        DiskSource::Volume { volume, .. } => Some(volume.as_str()),
        DiskSource::File { path } => file_name(path),
        DiskSource::None => None,
    };

    own.into_iter()
        .chain(disk.backing_file.as_deref().and_then(file_name))
        .find_map(|v| parse_volume_name(v).map(|(name, _)| name))
}

fn file_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|n| n.to_str())
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment: {}", self.name)?;
        if self.description.is_empty() {
            writeln!(f)?;
        } else {
            writeln!(f, " ({})", self.description)?;
        }

        writeln!(
            f,
            "  Network: {}  {}",
            self.infra.network.name, self.infra.network.address
        )?;
        writeln!(f, "  Machines:")?;

        let width = self
            .infra
            .machines
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0);

        for m in &self.infra.machines {
            write!(
                f,
                "    - {:width$}  {}",
                m.name,
                self.machine_address(m),
                width = width
            )?;
            if let Some(image) = base_image(m) {
                write!(f, "  {}", image)?;
            }
            if m.active {
                writeln!(f, "  active")?;
            } else {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(source: DiskSource, backing: Option<&str>) -> Disk {
        Disk {
            source,
            backing_file: backing.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_image_from_backing_file() {
        let dom = Domain {
            disks: vec![disk(
                DiskSource::Volume {
                    pool: "default".to_string(),
                    volume: "db1-root.qcow2".to_string(),
                },
                Some("/var/lib/libvirt/images/debian11-base.qcow2"),
            )],
            ..Default::default()
        };
        assert_eq!(base_image(&dom), Some("debian11"));
    }

    #[test]
    fn test_base_image_first_matching_disk() {
        let dom = Domain {
            disks: vec![
                disk(DiskSource::File { path: "/iso/cloudinit.iso".to_string() }, None),
                disk(DiskSource::File { path: "/images/rocky9-base.qcow2".to_string() }, None),
                disk(DiskSource::File { path: "/images/debian11-base.qcow2".to_string() }, None),
            ],
            ..Default::default()
        };
        assert_eq!(base_image(&dom), Some("rocky9"));
    }

    #[test]
    fn test_no_base_image() {
        let dom = Domain {
            disks: vec![disk(DiskSource::None, None)],
            ..Default::default()
        };
        assert_eq!(base_image(&dom), None);
    }
}
