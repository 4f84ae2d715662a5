//! OS images stored as base volumes.
//!
//! An image named `debian11` lives in its pool as the volume
//! `debian11-base.qcow2`. [`volume_name`] and [`parse_volume_name`] are the
//! only places where that convention is spelled out.

use std::fmt;
use std::path::Path;

use carcass_hypervisor::{
    size_pretty, upload, HypervisorClient, HypervisorError, Volume, DEFAULT_VOLUME_FORMAT,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::ImageError;
use crate::source::SourceOpener;
use crate::source_map;

const BASE_SUFFIX: &str = "-base";

/// Volume name of the image `name` in `format`, the default format when
/// empty.
pub fn volume_name(name: &str, format: &str) -> String {
    let format = if format.is_empty() {
        DEFAULT_VOLUME_FORMAT
    } else {
        format
    };
    format!("{}{}.{}", name, BASE_SUFFIX, format)
}

/// Split a base volume name into image name and format.
///
/// Returns `None` for volumes that are not base images.
pub fn parse_volume_name(volume: &str) -> Option<(&str, &str)> {
    let (stem, format) = volume.rsplit_once('.')?;
    let name = stem.strip_suffix(BASE_SUFFIX)?;
    if name.is_empty() || format.is_empty() {
        return None;
    }
    Some((name, format))
}

/// An OS image, i.e. a base volume plus where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub pool: String,
    /// Location the image was fetched from, empty when unknown
    pub source: String,
    pub path: String,
    pub format: String,
    pub capacity: u64,
    pub size: u64,
}

impl Image {
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Name of the backing volume.
    pub fn volume_name(&self) -> String {
        volume_name(&self.name, &self.format)
    }

    fn from_volume(pool: &str, volume: Volume) -> Option<Self> {
        let (name, _) = parse_volume_name(&volume.name)?;
        Some(Self {
            name: name.to_string(),
            pool: pool.to_string(),
            source: String::new(),
            path: volume.path,
            format: volume.format,
            capacity: volume.capacity,
            size: volume.size,
        })
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        writeln!(f, "  pool: {}", self.pool)?;
        writeln!(f, "  source: {}", self.source)?;
        writeln!(f, "  path: {}", self.path)?;
        writeln!(f, "  format: {}", self.format)?;
        write!(
            f,
            "  space: {}/{}",
            size_pretty(self.size),
            size_pretty(self.capacity)
        )
    }
}

/// Stores images into the pools of a hypervisor.
#[derive(Clone)]
pub struct ImageStore {
    client: HypervisorClient,
}

impl ImageStore {
    pub fn new(client: HypervisorClient) -> Self {
        Self { client }
    }

    /// Whether the base volume of the image exists.
    pub async fn exists(&self, image: &Image) -> Result<bool, ImageError> {
        self.client
            .volume_exists(&image.pool, &image.volume_name())
            .await
            .map_err(|source| ImageError::Lookup {
                name: image.name.clone(),
                source,
            })
    }

    /// Create the base volume of the image from its source.
    ///
    /// An existing volume is never overwritten. When the upload fails after
    /// the volume was created, the volume is removed again.
    #[instrument(skip(self, image, opener), fields(image = %image.name, pool = %image.pool))]
    pub async fn store(&self, image: &Image, opener: &dyn SourceOpener) -> Result<(), ImageError> {
        if self.exists(image).await? {
            return Err(ImageError::AlreadyExists {
                name: image.name.clone(),
                pool: image.pool.clone(),
            });
        }

        let source = opener.open(&image.source).await?;
        let vol_name = image.volume_name();

        info!(source = %image.source, length = source.length, "Storing image");

        let err = match upload(
            &self.client,
            &image.pool,
            &vol_name,
            &image.format,
            source.reader,
            source.length,
        )
        .await
        {
            Ok(()) => {
                info!("Image stored");
                return Ok(());
            }
            Err(err) => err,
        };

        if !err.volume_created() {
            return Err(ImageError::Transfer(err));
        }

        match self.client.remove_volume(&image.pool, &vol_name).await {
            Ok(()) => Err(ImageError::Transfer(err)),
            Err(HypervisorError::NotFound { .. }) => Err(ImageError::Transfer(err)),
            Err(cleanup) => {
                warn!(error = %cleanup, "Could not remove volume after failed upload");
                Err(ImageError::TransferAndCleanup {
                    transfer: err,
                    cleanup,
                })
            }
        }
    }

    /// Remove the base volume of the image. Nothing happens when it does not
    /// exist.
    #[instrument(skip(self, image), fields(image = %image.name, pool = %image.pool))]
    pub async fn drop_image(&self, image: &Image) -> Result<(), ImageError> {
        if !self.exists(image).await? {
            return Ok(());
        }

        match self.client.remove_volume(&image.pool, &image.volume_name()).await {
            Ok(()) | Err(HypervisorError::NotFound { .. }) => Ok(()),
            Err(source) => Err(ImageError::Remove {
                name: image.name.clone(),
                source,
            }),
        }
    }

    /// The images of a pool, with their recorded source when `dir` holds a
    /// provenance file.
    pub async fn list(&self, pool: &str, dir: Option<&Path>) -> Result<Vec<Image>, ImageError> {
        let volumes = self
            .client
            .list_volumes(pool)
            .await
            .map_err(|source| ImageError::Lookup {
                name: pool.to_string(),
                source,
            })?;

        let sources = match dir {
            Some(dir) => source_map::pool_sources(dir, pool).await,
            None => source_map::PoolSources::new(),
        };

        Ok(volumes
            .into_items()
            .into_iter()
            .filter_map(|vol| Image::from_volume(pool, vol))
            .map(|mut image| {
                image.source = sources.get(&image.name).cloned().unwrap_or_default();
                image
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_convention() {
        assert_eq!(volume_name("debian11", ""), "debian11-base.qcow2");
        assert_eq!(volume_name("debian11", "raw"), "debian11-base.raw");
        assert_eq!(Image::new("rocky9", "default").volume_name(), "rocky9-base.qcow2");
    }

    #[test]
    fn test_parse_volume_name() {
        assert_eq!(parse_volume_name("debian11-base.qcow2"), Some(("debian11", "qcow2")));
        assert_eq!(parse_volume_name("my-os-base.raw"), Some(("my-os", "raw")));
        assert_eq!(parse_volume_name("db1-root.qcow2"), None);
        assert_eq!(parse_volume_name("-base.qcow2"), None);
        assert_eq!(parse_volume_name("debian11-base"), None);

        let name = volume_name("debian-11.5", "");
        assert_eq!(parse_volume_name(&name), Some(("debian-11.5", "qcow2")));
    }

    #[test]
    fn test_display() {
        let image = Image {
            name: "debian11".to_string(),
            pool: "default".to_string(),
            source: "file:///tmp/d11.qcow2".to_string(),
            path: "/var/lib/libvirt/images/debian11-base.qcow2".to_string(),
            format: "qcow2".to_string(),
            capacity: 2147483648,
            size: 3 * 1024 * 1024,
        };
        assert_eq!(
            image.to_string(),
            "debian11:\n  pool: default\n  source: file:///tmp/d11.qcow2\n  \
             path: /var/lib/libvirt/images/debian11-base.qcow2\n  format: qcow2\n  \
             space: 3.00 MB/2.00 GB"
        );
    }
}
