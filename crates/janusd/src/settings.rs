//! Configuration loading: INI file plus command-line overrides.
//!
//! Any value on the command line wins over the file; the file wins over the
//! built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ini::Ini;
use tracing::warn;

use janus_gateway_core::config::{GatewayConfig, PortRange};

use crate::Cli;

/// Resolve the configuration file path: `--config` wins, otherwise
/// `<configs_folder>/janus.cfg`.
pub fn config_file_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    let folder = cli
        .configs_folder
        .clone()
        .unwrap_or_else(|| PathBuf::from("./conf"));
    folder.join("janus.cfg")
}

/// Load the INI file into a [`GatewayConfig`]. A missing or unreadable file
/// is only fatal when it was requested explicitly; otherwise the defaults
/// carry on.
pub fn load(path: &Path, explicit: bool) -> anyhow::Result<GatewayConfig> {
    let ini = match Ini::load_from_file(path) {
        Ok(ini) => ini,
        Err(e) if explicit => {
            return Err(e).with_context(|| format!("reading configuration from {}", path.display()))
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "couldn't read configuration file, continuing with defaults"
            );
            return Ok(GatewayConfig::default());
        }
    };

    let mut config = GatewayConfig::default();
    if let Some(general) = ini.section(Some("general")) {
        if let Some(v) = general.get("configs_folder") {
            config.general.configs_folder = PathBuf::from(v);
        }
        if let Some(v) = general.get("plugins_folder") {
            config.general.plugins_folder = PathBuf::from(v);
        }
        if let Some(v) = general.get("interface") {
            config.general.interface = Some(v.to_owned());
        }
    }
    if let Some(webserver) = ini.section(Some("webserver")) {
        if let Some(v) = webserver.get("http") {
            config.webserver.http = parse_bool(v);
        }
        if let Some(v) = webserver.get("port").and_then(|v| v.parse().ok()) {
            config.webserver.port = v;
        }
        if let Some(v) = webserver.get("https") {
            config.webserver.https = parse_bool(v);
        }
        if let Some(v) = webserver.get("secure_port").and_then(|v| v.parse().ok()) {
            config.webserver.secure_port = Some(v);
        }
        if let Some(v) = webserver.get("base_path") {
            config.webserver.base_path = v.to_owned();
        }
    }
    if let Some(certificates) = ini.section(Some("certificates")) {
        if let Some(v) = certificates.get("cert_pem") {
            config.certificates.cert_pem = Some(PathBuf::from(v));
        }
        if let Some(v) = certificates.get("cert_key") {
            config.certificates.cert_key = Some(PathBuf::from(v));
        }
    }
    if let Some(media) = ini.section(Some("media")) {
        if let Some(v) = media.get("rtp_port_range") {
            match PortRange::parse(v) {
                Some(range) => config.media.rtp_port_range = Some(range),
                None => warn!(value = v, "ignoring unparseable rtp_port_range"),
            }
        }
    }
    if let Some(nat) = ini.section(Some("nat")) {
        if let Some(v) = nat.get("public_ip") {
            config.nat.public_ip = Some(v.to_owned());
        }
        if let Some(v) = nat.get("stun_server") {
            config.nat.stun_server = Some(v.to_owned());
        }
        if let Some(v) = nat.get("stun_port").and_then(|v| v.parse().ok()) {
            config.nat.stun_port = v;
        }
    }
    Ok(config)
}

/// Apply the command-line overrides on top of the loaded configuration.
pub fn apply_cli(config: &mut GatewayConfig, cli: &Cli) {
    if let Some(v) = &cli.configs_folder {
        config.general.configs_folder = v.clone();
    }
    if let Some(v) = &cli.plugins_folder {
        config.general.plugins_folder = v.clone();
    }
    if let Some(v) = &cli.interface {
        config.general.interface = Some(v.clone());
    }
    if cli.no_http {
        config.webserver.http = false;
    }
    if let Some(v) = cli.port {
        config.webserver.port = v;
    }
    if let Some(v) = cli.secure_port {
        config.webserver.https = true;
        config.webserver.secure_port = Some(v);
    }
    if let Some(v) = &cli.base_path {
        config.webserver.base_path = v.clone();
    }
    if let Some(v) = &cli.cert_pem {
        config.certificates.cert_pem = Some(v.clone());
    }
    if let Some(v) = &cli.cert_key {
        config.certificates.cert_key = Some(v.clone());
    }
    if let Some(v) = &cli.stun_server {
        // `host:port` or bare host; a missing port falls back to the default.
        match v.rsplit_once(':').and_then(|(host, port)| {
            port.parse::<u16>().ok().map(|port| (host.to_owned(), port))
        }) {
            Some((host, port)) => {
                config.nat.stun_server = Some(host);
                config.nat.stun_port = port;
            }
            None => {
                config.nat.stun_server = Some(v.clone());
                config.nat.stun_port = 3478;
            }
        }
    }
    if let Some(v) = &cli.public_ip {
        config.nat.public_ip = Some(v.clone());
    }
    if let Some(v) = &cli.rtp_port_range {
        match PortRange::parse(v) {
            Some(range) => config.media.rtp_port_range = Some(range),
            None => warn!(value = %v, "ignoring unparseable --rtp-port-range"),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "on"
    )
}
