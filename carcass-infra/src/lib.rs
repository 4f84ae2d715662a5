//! # carcass Infra
//!
//! Everything above the hypervisor client:
//! - [`image`]: OS images stored as base volumes, with their provenance
//! - [`infrastructure`]: a network and its machines, started and stopped as
//!   a unit
//! - [`environment`]: the user facing view of an infrastructure
//! - [`config`]: settings file and command line overrides

pub mod config;
pub mod environment;
pub mod error;
pub mod image;
pub mod infrastructure;
pub mod source;
pub mod source_map;

pub use config::{CliOverrides, LogFormat, Settings};
pub use environment::Environment;
pub use error::{ImageError, InfraError, ProvenanceError, SourceError};
pub use image::{parse_volume_name, volume_name, Image, ImageStore};
pub use infrastructure::{ControlAction, ControlReport, Infrastructure, MachineOutcome};
pub use source::{DefaultSourceOpener, OpenedSource, SourceLocation, SourceOpener};
pub use source_map::{add_provenance, remove_provenance, source_map_path};
