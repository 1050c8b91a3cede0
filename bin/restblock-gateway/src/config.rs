//! Gateway configuration file
//!
//! ```toml
//! [driver]
//! request_timeout_secs = 30
//! thread_pool_size = 8
//!
//! [gateway]
//! nbd_listen = "127.0.0.1:10809"
//! control_socket = "/run/restblock/control.sock"
//! servers = ["http://10.0.0.1:80/volumes"]
//!
//! [[gateway.attach]]
//! object = "disk0"
//! device = "srba"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use restblock_common::DriverConfig;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_nbd_listen")]
    pub nbd_listen: String,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// Server base URLs added at startup
    #[serde(default)]
    pub servers: Vec<String>,
    /// Objects attached at startup
    #[serde(default)]
    pub attach: Vec<AttachSpec>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            nbd_listen: default_nbd_listen(),
            control_socket: default_control_socket(),
            servers: Vec::new(),
            attach: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachSpec {
    pub object: String,
    pub device: String,
}

impl std::str::FromStr for AttachSpec {
    type Err = String;

    /// `object:device`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object, device) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <object>:<device>, got {s:?}"))?;
        if object.is_empty() || device.is_empty() {
            return Err(format!("expected <object>:<device>, got {s:?}"));
        }
        Ok(Self {
            object: object.to_string(),
            device: device.to_string(),
        })
    }
}

fn default_nbd_listen() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/restblock/control.sock")
}

impl GatewayConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config file {}", path.display()))
    }
}
