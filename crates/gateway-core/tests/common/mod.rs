//! Shared fixtures: a recording echo plugin and a gateway wired to the
//! loopback ICE transport with per-handle link tracking.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use janus_gateway_core::ice::{IceFactory, IceLink, LoopbackFactory, LoopbackLink};
use janus_gateway_core::jsep::{Jsep, SdpKind};
use janus_gateway_core::plugin::{InboundMessage, Plugin};
use janus_gateway_core::{Dispatcher, Gateway, Handle, PluginHost, Result};

pub const ECHO_PACKAGE: &str = "janus.plugin.echotest";

/// Minimal plugin: records lifecycle calls and echoes message bodies back as
/// events, answering any offer it is given.
#[derive(Default)]
pub struct EchoPlugin {
    gateway: OnceLock<Arc<Gateway>>,
    pub lifecycle: Mutex<Vec<String>>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl EchoPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lifecycle(&self) -> Vec<String> {
        self.lifecycle.lock().unwrap().clone()
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn version(&self) -> u32 {
        1
    }

    fn version_string(&self) -> &str {
        "0.1.0"
    }

    fn name(&self) -> &str {
        "Echo test plugin"
    }

    fn description(&self) -> &str {
        "Echoes message bodies back as asynchronous events"
    }

    fn package(&self) -> &str {
        ECHO_PACKAGE
    }

    async fn init(&self, gateway: Arc<Gateway>, _config_dir: &Path) -> Result<()> {
        let _ = self.gateway.set(gateway);
        Ok(())
    }

    async fn destroy(&self) {}

    async fn create_session(&self, handle: Arc<Handle>) -> Result<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.lifecycle
            .lock()
            .unwrap()
            .push(format!("create:{}", handle.id()));
        Ok(())
    }

    async fn destroy_session(&self, handle: Arc<Handle>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.lifecycle
            .lock()
            .unwrap()
            .push(format!("destroy:{}", handle.id()));
        Ok(())
    }

    async fn handle_message(&self, message: InboundMessage) {
        let Some(gateway) = self.gateway.get() else { return };
        let jsep = message.jsep.as_ref().map(|jsep| Jsep {
            kind: SdpKind::Answer,
            sdp: jsep.sdp.clone(),
        });
        let data = json!({ "echotest": "event", "result": message.body });
        let _ = gateway
            .push_event(
                &message.handle,
                self,
                message.transaction.as_deref(),
                data,
                jsep,
            )
            .await;
    }

    async fn setup_media(&self, _handle: Arc<Handle>) {}

    async fn hangup_media(&self, _handle: Arc<Handle>) {}

    fn incoming_rtp(&self, _handle: &Arc<Handle>, _video: bool, _buf: &[u8]) {}

    fn incoming_rtcp(&self, _handle: &Arc<Handle>, _video: bool, _buf: &mut [u8]) {}
}

/// Loopback factory that remembers every link it created, keyed by handle.
pub struct TrackingFactory {
    inner: LoopbackFactory,
    pub links: DashMap<u64, Arc<LoopbackLink>>,
}

impl TrackingFactory {
    pub fn new(inner: LoopbackFactory) -> Self {
        Self {
            inner,
            links: DashMap::new(),
        }
    }
}

impl IceFactory for TrackingFactory {
    fn create_link(&self, handle_id: u64) -> Arc<dyn IceLink> {
        let link = self.inner.create_loopback(handle_id);
        self.links.insert(handle_id, link.clone());
        link
    }
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub plugins: Arc<PluginHost>,
    pub dispatcher: Dispatcher,
    pub ice: Arc<TrackingFactory>,
    pub echo: Arc<EchoPlugin>,
    pub stop: CancellationToken,
}

/// Build a gateway with the echo plugin registered and a short long-poll
/// timeout so nothing in the suite waits 30 seconds.
pub async fn test_gateway() -> TestGateway {
    let stop = CancellationToken::new();
    let ice = Arc::new(TrackingFactory::new(LoopbackFactory::default()));
    let gateway = Arc::new(Gateway::new(ice.clone(), stop.clone()));
    let plugins = Arc::new(PluginHost::new(stop.clone()));
    let echo = EchoPlugin::new();
    plugins
        .register(echo.clone(), gateway.clone(), Path::new("/tmp"))
        .await
        .expect("echo plugin registers");
    let dispatcher = Dispatcher::new(gateway.clone(), plugins.clone())
        .with_poll_timeout(Duration::from_millis(200));
    TestGateway {
        gateway,
        plugins,
        dispatcher,
        ice,
        echo,
        stop,
    }
}

/// A well-formed offer with one audio and one video section.
pub const OFFER_SDP: &str = "v=0\r\n\
    o=- 42 1 IN IP4 192.0.2.10\r\n\
    s=test\r\n\
    t=0 0\r\n\
    m=audio 5000 RTP/SAVPF 111\r\n\
    c=IN IP4 192.0.2.10\r\n\
    a=ice-ufrag:browser\r\n\
    a=ice-pwd:browsersecret\r\n\
    a=fingerprint:sha-256 AA:BB:CC\r\n\
    a=candidate:1 1 udp 1 192.0.2.10 5000 typ host\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    m=video 5002 RTP/SAVPF 100\r\n\
    c=IN IP4 192.0.2.10\r\n\
    a=rtpmap:100 VP8/90000\r\n";
