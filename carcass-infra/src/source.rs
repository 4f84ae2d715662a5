//! Image sources.
//!
//! A source is a local path, a `file://` URL or an `http(s)://` URL. Opening
//! it gives a reader along with the exact size of the content, which is
//! needed up front to size the destination volume.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};
use url::Url;

use crate::error::SourceError;

/// An opened image source.
pub struct OpenedSource {
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    /// Exact size of the content in bytes
    pub length: u64,
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSource")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Opens image sources by location.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, location: &str) -> Result<OpenedSource, SourceError>;
}

/// Where a location points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    File(PathBuf),
    Http(Url),
}

impl SourceLocation {
    /// Classify a location. Anything that does not parse as an absolute URL
    /// is taken as a file path.
    pub fn parse(location: &str) -> Result<Self, SourceError> {
        let url = match Url::parse(location) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(SourceLocation::File(PathBuf::from(location)))
            }
            Err(e) => {
                return Err(SourceError::InvalidLocation {
                    location: location.to_string(),
                    message: e.to_string(),
                })
            }
        };

        match url.scheme() {
            "http" | "https" => Ok(SourceLocation::Http(url)),
            "file" => url
                .to_file_path()
                .map(SourceLocation::File)
                .map_err(|_| SourceError::InvalidLocation {
                    location: location.to_string(),
                    message: "not a local file path".to_string(),
                }),
            _ => Err(SourceError::UnsupportedScheme(location.to_string())),
        }
    }
}

/// Opens files from the local filesystem and downloads over HTTP.
#[derive(Debug, Clone, Default)]
pub struct DefaultSourceOpener {
    http: reqwest::Client,
}

impl DefaultSourceOpener {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open_file(&self, path: &Path) -> Result<OpenedSource, SourceError> {
        let io_err = |source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let length = file.metadata().await.map_err(io_err)?.len();
        debug!(path = %path.display(), length, "Opened file source");

        Ok(OpenedSource {
            reader: Box::new(file),
            length,
        })
    }

    async fn open_http(&self, url: Url) -> Result<OpenedSource, SourceError> {
        let response = self.http.get(url.clone()).send().await?.error_for_status()?;

        let length = response
            .content_length()
            .ok_or_else(|| SourceError::UnknownLength(url.to_string()))?;
        debug!(url = %url, length, "Opened http source");

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        Ok(OpenedSource {
            reader: Box::new(StreamReader::new(Box::pin(stream))),
            length,
        })
    }
}

#[async_trait]
impl SourceOpener for DefaultSourceOpener {
    #[instrument(skip(self))]
    async fn open(&self, location: &str) -> Result<OpenedSource, SourceError> {
        match SourceLocation::parse(location)? {
            SourceLocation::File(path) => self.open_file(&path).await,
            SourceLocation::Http(url) => self.open_http(url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            SourceLocation::parse("/tmp/d11.qcow2").unwrap(),
            SourceLocation::File(PathBuf::from("/tmp/d11.qcow2"))
        );
        assert_eq!(
            SourceLocation::parse("images/d11.qcow2").unwrap(),
            SourceLocation::File(PathBuf::from("images/d11.qcow2"))
        );
        assert_eq!(
            SourceLocation::parse("file:///tmp/d11.qcow2").unwrap(),
            SourceLocation::File(PathBuf::from("/tmp/d11.qcow2"))
        );
        assert!(matches!(
            SourceLocation::parse("https://cloud.debian.org/d11.qcow2").unwrap(),
            SourceLocation::Http(_)
        ));
        assert!(matches!(
            SourceLocation::parse("ftp://mirror/d11.qcow2"),
            Err(SourceError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.qcow2");
        std::fs::write(&path, b"0123456789").unwrap();

        let location = format!("file://{}", path.display());
        let mut opened = DefaultSourceOpener::new().open(&location).await.unwrap();
        assert_eq!(opened.length, 10);

        let mut content = Vec::new();
        opened.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"0123456789");
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = DefaultSourceOpener::new()
            .open("/nonexistent/carcass/img.qcow2")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }
}
