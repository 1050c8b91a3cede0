//! RestBlock Common - Shared types and utilities
//!
//! This crate provides the configuration types, the error taxonomy and the
//! object URL grammar used by the block driver and its binaries.

pub mod config;
pub mod error;
pub mod url;

pub use config::{CompletionPolicy, DebugLevel, DriverConfig};
pub use error::{Error, Result};
pub use url::{ObjectUrl, URL_MAX_LEN, UrlError};

/// Sector size exposed to the host block layer
pub const SECTOR_SIZE: u64 = 512;
