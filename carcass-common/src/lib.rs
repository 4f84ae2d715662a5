//! # carcass Common
//!
//! Shared utilities for the carcass crates.
//!
//! ```rust
//! use carcass_common::{init_logging, is_valid_name};
//!
//! init_logging("warn").unwrap();
//! assert!(is_valid_name("debian-11.5"));
//! ```

pub mod logging;
pub mod paths;

pub use logging::{init_logging, init_logging_json};
pub use paths::{expand_data_dir, is_valid_name};
