//! Error types for the hypervisor layer.
//!
//! Three levels are kept apart:
//! - [`BackendError`] is what a backend (libvirt, mock) reports for a native call.
//! - [`HypervisorError`] is what the client reports once the native failure has
//!   been put in context.
//! - [`TransferError`] covers the streamed upload of a volume.

use std::fmt;

use thiserror::Error;

/// Kind of hypervisor object, used to qualify lookups and skipped items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Domain,
    Pool,
    Volume,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Domain => "domain",
            ResourceKind::Pool => "storage pool",
            ResourceKind::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single native call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The object does not exist on the hypervisor.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// The driver does not implement the requested operation.
    #[error("operation not supported by the driver: {0}")]
    Unsupported(String),

    /// Any other native failure.
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        BackendError::NotFound { kind, name: name.into() }
    }

    /// True when the error says that an object of `kind` is absent.
    pub fn is_not_found(&self, kind: ResourceKind) -> bool {
        matches!(self, BackendError::NotFound { kind: k, .. } if *k == kind)
    }
}

/// Result type alias for native calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors reported by the hypervisor client.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("could not connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The requested object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// A descriptor could not be decoded.
    #[error("could not decode the description of the {kind}: {message}")]
    DecodeFailed { kind: ResourceKind, message: String },

    /// A read or lookup failed for another reason than absence.
    #[error("could not query {kind} {name}: {source}")]
    QueryFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: BackendError,
    },

    /// Creation of an object failed.
    #[error("could not create {kind} {name}: {source}")]
    CreateFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: BackendError,
    },

    /// Removal of an object failed.
    #[error("could not remove {kind} {name}: {source}")]
    RemoveFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: BackendError,
    },

    /// A start or shutdown request was refused.
    #[error("could not {action} domain {name}: {source}")]
    ControlFailed {
        action: &'static str,
        name: String,
        #[source]
        source: BackendError,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Map a native lookup failure, keeping absence distinct from other failures.
    pub(crate) fn from_lookup(kind: ResourceKind, name: &str, err: BackendError) -> Self {
        match err {
            BackendError::NotFound { kind, name } => HypervisorError::NotFound { kind, name },
            other => HypervisorError::QueryFailed {
                kind,
                name: name.to_string(),
                source: other,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Errors of a streamed volume upload.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The destination volume could not be created; nothing was left behind.
    #[error("volume create failed: {0}")]
    Create(#[source] HypervisorError),

    /// The upload stream could not be opened on the new volume.
    #[error("could not open upload stream: {0}")]
    Open(#[source] BackendError),

    /// Reading the source failed; the stream was aborted.
    #[error("could not read input: {0}")]
    Read(#[source] std::io::Error),

    /// Reading the source failed and aborting the stream failed too.
    #[error("stream abort failed: {abort} and could not read input: {read}")]
    ReadAndAbort {
        read: std::io::Error,
        abort: BackendError,
    },

    /// Sending a chunk failed.
    #[error("stream send failed: {0}")]
    Send(#[source] BackendError),

    /// Finalizing the stream failed.
    #[error("stream finish failed: {0}")]
    Finish(#[source] BackendError),
}

impl TransferError {
    /// True once the destination volume exists, i.e. a caller has something
    /// to clean up.
    pub fn volume_created(&self) -> bool {
        !matches!(self, TransferError::Create(_))
    }
}
