//! The gateway daemon: configuration, plugin loading, HTTP(S) transport,
//! and shutdown orchestration.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use janus_gateway_core::ice::LoopbackFactory;
use janus_gateway_core::{Dispatcher, Gateway, PluginHost};
use janus_plugin_videocall::VideoCallPlugin;
use janusd::http::{self, AppState};
use janusd::{settings, Cli};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("janusd: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("starting Janus (WebRTC gateway)");

    let config_file = settings::config_file_path(&cli);
    info!(path = %config_file.display(), "reading configuration");
    let mut config = settings::load(&config_file, cli.config.is_some())?;
    settings::apply_cli(&mut config, &cli);
    let base_path = config.normalized_base_path()?;

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    // Media transport. The in-process loopback stands in for a real ICE
    // agent; it honours the configured public address and port range so SDP
    // merging behaves as deployed.
    let public_ip = config.public_ip();
    if config.nat.public_ip.is_some() && public_ip.is_none() {
        warn!(
            value = config.nat.public_ip.as_deref().unwrap_or_default(),
            "ignoring unparseable public_ip"
        );
    }
    let media_ip = public_ip.unwrap_or(IpAddr::from([127, 0, 0, 1]));
    let base_port = config
        .media
        .rtp_port_range
        .map(|range| range.min)
        .filter(|min| *min > 0)
        .unwrap_or(10_000);
    let ice = Arc::new(LoopbackFactory::new(media_ip, base_port));

    let gateway = Arc::new(Gateway::new(ice, stop.clone()).with_public_ip(public_ip));
    let plugins = Arc::new(PluginHost::new(stop.clone()));
    plugins
        .register(
            Arc::new(VideoCallPlugin::new()),
            gateway.clone(),
            &config.general.configs_folder,
        )
        .await
        .context("loading the videocall plugin")?;

    let dispatcher = Arc::new(Dispatcher::new(gateway.clone(), plugins.clone()));
    let app = http::router(Arc::new(AppState {
        dispatcher,
        base_path: base_path.clone(),
    }));

    let bind_ip: IpAddr = config
        .general
        .interface
        .as_deref()
        .and_then(|iface| iface.parse().ok())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));

    let mut servers = tokio::task::JoinSet::new();
    if config.webserver.http {
        let addr = SocketAddr::new(bind_ip, config.webserver.port);
        servers.spawn(http::serve_http(addr, app.clone(), stop.clone()));
    } else {
        info!("HTTP webserver disabled");
    }
    if config.webserver.https {
        let secure_port = config
            .webserver
            .secure_port
            .context("HTTPS enabled but no secure_port configured")?;
        let cert_pem = config
            .certificates
            .cert_pem
            .clone()
            .context("HTTPS enabled but no certificate configured")?;
        let cert_key = config
            .certificates
            .cert_key
            .clone()
            .unwrap_or_else(|| cert_pem.clone());
        let addr = SocketAddr::new(bind_ip, secure_port);
        servers.spawn(http::serve_https(
            addr,
            app.clone(),
            cert_pem,
            cert_key,
            stop.clone(),
        ));
    } else {
        info!("HTTPS webserver disabled");
    }
    if servers.is_empty() {
        anyhow::bail!("no webserver (HTTP/HTTPS) started, giving up");
    }

    while let Some(finished) = servers.join_next().await {
        if let Err(e) = finished.context("webserver task panicked")? {
            // A listener failing takes the whole gateway down.
            stop.cancel();
            plugins.shutdown().await;
            return Err(e);
        }
    }

    // All listeners have drained; tear the plugins down last.
    plugins.shutdown().await;
    info!("bye!");
    Ok(())
}

/// First SIGINT asks every cooperative loop to stop; the third one gives up
/// waiting and exits hard.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            received += 1;
            match received {
                1 => {
                    info!("stopping gateway");
                    stop.cancel();
                }
                2 => warn!("still shutting down, interrupt again to force exit"),
                _ => {
                    warn!("forcing exit");
                    std::process::exit(1);
                }
            }
        }
    });
}
