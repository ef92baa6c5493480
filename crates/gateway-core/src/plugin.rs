//! The plugin host: the contract plugins implement, the directory they are
//! registered in, and the per-plugin worker that serializes their message
//! handling.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::handle::Handle;
use crate::jsep::Jsep;

/// A signaling message queued for a plugin.
#[derive(Debug)]
pub struct InboundMessage {
    pub handle: Arc<Handle>,
    pub transaction: Option<String>,
    /// The request body, already validated to be a JSON object.
    pub body: Value,
    /// The browser's JSEP, already anonymized by the SDP bridge.
    pub jsep: Option<Jsep>,
}

/// The capability set every plugin must provide.
///
/// Metadata getters describe the plugin; `init`/`destroy` bracket its
/// process lifetime; the per-handle entry points are invoked by the gateway
/// as sessions attach, exchange messages, and go away. Media ingress
/// (`incoming_rtp`/`incoming_rtcp`) runs on the relay path and must not
/// block.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn version(&self) -> u32;
    fn version_string(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Dotted package identifier, e.g. `janus.plugin.videocall`. Unique
    /// across the loaded set.
    fn package(&self) -> &str;

    /// Called once at registration. `config_dir` is the folder holding
    /// per-plugin configuration files.
    async fn init(&self, gateway: Arc<Gateway>, config_dir: &Path) -> Result<()>;
    /// Called once at shutdown, after the plugin's worker has exited.
    async fn destroy(&self);

    async fn create_session(&self, handle: Arc<Handle>) -> Result<()>;
    async fn destroy_session(&self, handle: Arc<Handle>) -> Result<()>;

    /// Handle one queued signaling message. Runs on the plugin's worker, so
    /// invocations are serialized per plugin.
    async fn handle_message(&self, message: InboundMessage);

    /// The media path for this handle is up.
    async fn setup_media(&self, handle: Arc<Handle>);
    /// The media path for this handle went away.
    async fn hangup_media(&self, handle: Arc<Handle>);

    fn incoming_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);
    /// RTCP ingress. The buffer is mutable so plugins can rewrite feedback
    /// in place (REMB capping) before relaying.
    fn incoming_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &mut [u8]);
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    queue: mpsc::UnboundedSender<InboundMessage>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Directory of loaded plugins keyed by package name, each with its own
/// message worker.
pub struct PluginHost {
    plugins: DashMap<String, Arc<PluginEntry>>,
    stop: CancellationToken,
}

impl PluginHost {
    pub fn new(stop: CancellationToken) -> Self {
        Self {
            plugins: DashMap::new(),
            stop,
        }
    }

    /// Validate, initialize, and register a plugin, spawning its worker.
    pub async fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        gateway: Arc<Gateway>,
        configs_folder: &Path,
    ) -> Result<()> {
        validate_metadata(plugin.as_ref())?;
        let package = plugin.package().to_owned();
        if self.plugins.contains_key(&package) {
            return Err(Error::DuplicatePlugin(package));
        }

        plugin
            .init(gateway.clone(), configs_folder)
            .await
            .map_err(|e| Error::PluginInit(package.clone(), e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(plugin.clone(), rx, gateway, self.stop.clone());
        let entry = Arc::new(PluginEntry {
            plugin: plugin.clone(),
            queue: tx,
            worker: std::sync::Mutex::new(Some(worker)),
        });
        if self.plugins.insert(package.clone(), entry).is_some() {
            // Lost a registration race for the same package name.
            return Err(Error::DuplicatePlugin(package));
        }
        info!(
            package = %package,
            name = plugin.name(),
            version = plugin.version_string(),
            "plugin registered"
        );
        Ok(())
    }

    pub fn find(&self, package: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(package).map(|e| e.plugin.clone())
    }

    pub fn packages(&self) -> Vec<String> {
        self.plugins.iter().map(|e| e.key().clone()).collect()
    }

    /// Queue a message for the plugin's worker.
    pub fn dispatch(&self, package: &str, message: InboundMessage) -> Result<()> {
        let entry = self
            .plugins
            .get(package)
            .ok_or_else(|| Error::Api(crate::error::ApiError::PluginNotFound(package.to_owned())))?;
        entry.queue.send(message).map_err(|_| Error::ShuttingDown)
    }

    /// Close every worker queue, wait for the workers to drain, then run
    /// each plugin's `destroy`.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<PluginEntry>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        self.plugins.clear();
        for entry in entries {
            let worker = entry.worker.lock().unwrap().take();
            let plugin = entry.plugin.clone();
            // The entry holds the last sender; dropping it closes the queue
            // and lets the worker drain out.
            drop(entry);
            if let Some(worker) = worker {
                if let Err(e) = worker.await {
                    warn!(error = %e, "plugin worker did not exit cleanly");
                }
            }
            plugin.destroy().await;
            info!(package = plugin.package(), "plugin destroyed");
        }
    }
}

fn validate_metadata(plugin: &dyn Plugin) -> Result<()> {
    if plugin.package().is_empty() || plugin.package().contains(char::is_whitespace) {
        return Err(Error::PluginMetadata(format!(
            "bad package name '{}'",
            plugin.package()
        )));
    }
    if plugin.name().is_empty() || plugin.version_string().is_empty() {
        return Err(Error::PluginMetadata(format!(
            "plugin '{}' is missing a name or version string",
            plugin.package()
        )));
    }
    if plugin.version() == 0 {
        return Err(Error::PluginMetadata(format!(
            "plugin '{}' reports version 0",
            plugin.package()
        )));
    }
    Ok(())
}

/// One worker per plugin: drains the queue in FIFO order and invokes
/// `handle_message`, skipping work for sessions that are going away. This
/// serializes plugin logic, so plugins need not be re-entrant.
fn spawn_worker(
    plugin: Arc<dyn Plugin>,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    gateway: Arc<Gateway>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(package = plugin.package(), "plugin worker running");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                next = rx.recv() => {
                    let Some(message) = next else { break };
                    let session = gateway.find_session(message.handle.session_id());
                    let gone = match &session {
                        None => true,
                        Some(s) => s.is_destroyed(),
                    };
                    if gone || message.handle.is_detached() {
                        debug!(
                            package = plugin.package(),
                            handle = message.handle.id(),
                            "dropping message for destroyed session"
                        );
                        continue;
                    }
                    plugin.handle_message(message).await;
                }
            }
        }
        debug!(package = plugin.package(), "plugin worker exiting");
    })
}
