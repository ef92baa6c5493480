//! Typed gateway configuration.
//!
//! Every setting has a sane default; the binary layers the INI file and the
//! command line on top of these structures.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub general: GeneralConfig,
    pub webserver: WebServerConfig,
    pub certificates: CertificatesConfig,
    pub media: MediaConfig,
    pub nat: NatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Folder holding the gateway and per-plugin configuration files.
    pub configs_folder: PathBuf,
    pub plugins_folder: PathBuf,
    /// Interface address to bind media to; picked automatically if unset.
    pub interface: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            configs_folder: PathBuf::from("./conf"),
            plugins_folder: PathBuf::from("./plugins"),
            interface: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebServerConfig {
    pub http: bool,
    pub port: u16,
    pub https: bool,
    pub secure_port: Option<u16>,
    pub base_path: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            http: true,
            port: 8088,
            https: false,
            secure_port: None,
            base_path: "/janus".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesConfig {
    pub cert_pem: Option<PathBuf>,
    pub cert_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub rtp_port_range: Option<PortRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub public_ip: Option<String>,
    pub stun_server: Option<String>,
    pub stun_port: u16,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            public_ip: None,
            stun_server: None,
            stun_port: 3478,
        }
    }
}

/// An inclusive RTP port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Parse a `min-max` range, swapping the bounds if they arrive reversed
    /// and treating a zero upper bound as the port-space maximum.
    pub fn parse(value: &str) -> Option<Self> {
        let (min, max) = value.split_once('-')?;
        let mut min: u16 = min.trim().parse().ok()?;
        let mut max: u16 = max.trim().parse().ok()?;
        if min > max {
            std::mem::swap(&mut min, &mut max);
        }
        if max == 0 {
            max = u16::MAX;
        }
        Some(Self { min, max })
    }
}

impl GatewayConfig {
    /// Check the invariants the rest of the gateway relies on, returning the
    /// base path with any trailing slash removed.
    pub fn normalized_base_path(&self) -> Result<String> {
        let base = &self.webserver.base_path;
        if !base.starts_with('/') {
            return Err(Error::Config(format!(
                "invalid base path '{base}' (it should start with a /, e.g., /janus)"
            )));
        }
        Ok(base.trim_end_matches('/').to_owned())
    }

    /// The address advertised in merged SDP, if one is configured.
    pub fn public_ip(&self) -> Option<IpAddr> {
        self.nat.public_ip.as_deref().and_then(|ip| ip.parse().ok())
    }
}
