//! Error types for the infrastructure layer.

use std::path::PathBuf;

use carcass_hypervisor::{HypervisorError, TransferError};
use thiserror::Error;

/// Failure to open an image source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported URL: {0}")]
    UnsupportedScheme(String),

    #[error("invalid source location {location}: {message}")]
    InvalidLocation { location: String, message: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http get failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The size of the content is not announced.
    #[error("size of {0} is unknown")]
    UnknownLength(String),
}

/// Failure to read or write the image provenance file.
#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("could not read source map file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode source map file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode source map: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not save source map file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors of the image store.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image {name} already exists in pool {pool}")]
    AlreadyExists { name: String, pool: String },

    #[error("could not check image {name}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("could not get image source: {0}")]
    Source(#[source] SourceError),

    #[error("image source {0} has no known size, the volume cannot be sized")]
    UnknownLength(String),

    #[error("volume upload failed: {0}")]
    Transfer(#[source] TransferError),

    #[error("could not clean volume: {cleanup} on upload failure: {transfer}")]
    TransferAndCleanup {
        transfer: TransferError,
        cleanup: HypervisorError,
    },

    #[error("could not remove image {name}: {source}")]
    Remove {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
}

impl From<SourceError> for ImageError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::UnknownLength(location) => ImageError::UnknownLength(location),
            other => ImageError::Source(other),
        }
    }
}

/// Errors of the infrastructure aggregate.
#[derive(Error, Debug)]
pub enum InfraError {
    #[error("could not find network {name} on hypervisor: {source}")]
    Network {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("could not find machines of network {name} on hypervisor: {source}")]
    Machines {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("could not list environments: {0}")]
    List(#[source] HypervisorError),
}
