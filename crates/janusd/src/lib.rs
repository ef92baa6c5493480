//! Gateway daemon internals: CLI definition, configuration loading, and the
//! HTTP(S) transport. The binary in `main.rs` wires these together.

pub mod http;
pub mod settings;

use std::path::PathBuf;

use clap::Parser;

/// Janus WebRTC gateway.
#[derive(Debug, Parser)]
#[command(name = "janusd", version, about = "Janus WebRTC gateway")]
pub struct Cli {
    /// Configuration file to use
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Folder holding the configuration files
    #[arg(long)]
    pub configs_folder: Option<PathBuf>,

    /// Folder holding the plugins
    #[arg(long)]
    pub plugins_folder: Option<PathBuf>,

    /// Interface to bind the webservers to
    #[arg(short, long)]
    pub interface: Option<String>,

    /// HTTP port for the control API
    #[arg(short, long)]
    pub port: Option<u16>,

    /// HTTPS port for the control API (enables HTTPS)
    #[arg(short, long)]
    pub secure_port: Option<u16>,

    /// Base path of the control API (e.g. /janus)
    #[arg(short, long)]
    pub base_path: Option<String>,

    /// Certificate chain (PEM) for HTTPS and DTLS
    #[arg(long)]
    pub cert_pem: Option<PathBuf>,

    /// Certificate key (PEM); defaults to the cert_pem file
    #[arg(long)]
    pub cert_key: Option<PathBuf>,

    /// STUN server to use, as host or host:port
    #[arg(long)]
    pub stun_server: Option<String>,

    /// Public address to advertise in SDP
    #[arg(long)]
    pub public_ip: Option<String>,

    /// RTP port range, as min-max
    #[arg(long)]
    pub rtp_port_range: Option<String>,

    /// Disable the plain HTTP listener
    #[arg(long)]
    pub no_http: bool,
}
