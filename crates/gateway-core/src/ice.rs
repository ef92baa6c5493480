//! The ICE/DTLS transport seam.
//!
//! The gateway core never talks to the network for media itself; it drives an
//! [`IceLink`] per handle. The trait covers exactly what the core needs:
//! local stream setup, remote description/candidate installation, candidate
//! gathering completion, the local credentials and candidates the SDP merge
//! step injects, and the RTP/RTCP egress path.
//!
//! [`LoopbackLink`] is the built-in in-process implementation. It performs no
//! network I/O: gathering completes immediately (or under manual control for
//! tests) and relayed packets go to an optional sink channel. A production
//! deployment substitutes a real agent behind the same factory.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::ids;

/// Which media stream a packet or candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Local ICE credentials and DTLS fingerprint, injected into outbound SDP.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
    /// `sha-256` fingerprint of the DTLS certificate.
    pub fingerprint: String,
}

/// Candidate gathering progress for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// Why a gathering wait did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringError {
    Failed,
    TimedOut,
}

/// One handle's ICE/DTLS context.
#[async_trait]
pub trait IceLink: Send + Sync {
    /// Allocate local media streams and start candidate gathering. The
    /// audio/video flags are hints from SDP pre-parsing; at most one stream
    /// of each kind is negotiated.
    fn setup_local(&self, audio: bool, video: bool);

    fn audio_stream(&self) -> Option<u32>;
    fn video_stream(&self) -> Option<u32>;

    /// Number of streams allocated by `setup_local`.
    fn streams(&self) -> u32;

    /// Hand the full remote description to the transport for parsing.
    fn apply_remote_description(&self, sdp: &str);

    /// Install the gathered remote candidates for one stream component and
    /// start connectivity checks.
    fn add_remote_candidates(&self, stream: u32, component: u8);

    /// Wait until candidate gathering has completed for every allocated
    /// stream.
    async fn wait_gathering(&self, timeout: Duration) -> Result<(), GatheringError>;

    fn local_credentials(&self) -> IceCredentials;

    /// Raw `candidate:...` attribute values for one stream.
    fn local_candidates(&self, stream: u32) -> Vec<String>;

    /// Whether the link has a negotiated, connected media path.
    fn has_media(&self) -> bool;

    /// Egress a protected RTP packet. No-op without active media.
    fn relay_rtp(&self, video: bool, buf: &[u8]);

    /// Egress a protected RTCP packet. No-op without active media.
    fn relay_rtcp(&self, video: bool, buf: &[u8]);

    /// Tear the media path down.
    fn hangup(&self);
}

/// Creates one [`IceLink`] per handle.
pub trait IceFactory: Send + Sync {
    fn create_link(&self, handle_id: u64) -> Arc<dyn IceLink>;
}

/// A packet handed to the loopback sink instead of the network.
#[derive(Debug, Clone)]
pub struct RelayedPacket {
    pub handle_id: u64,
    pub video: bool,
    pub rtcp: bool,
    pub payload: Vec<u8>,
}

/// In-process transport: no sockets, no DTLS, immediate gathering.
pub struct LoopbackFactory {
    public_ip: IpAddr,
    base_port: u16,
    manual_gathering: bool,
    sink: Option<mpsc::UnboundedSender<RelayedPacket>>,
}

impl LoopbackFactory {
    pub fn new(public_ip: IpAddr, base_port: u16) -> Self {
        Self {
            public_ip,
            base_port,
            manual_gathering: false,
            sink: None,
        }
    }

    /// Gathering stays in progress until `complete_gathering` or
    /// `fail_gathering` is called on the link. Used by tests that exercise
    /// the bridge's wait path.
    pub fn manual_gathering(mut self) -> Self {
        self.manual_gathering = true;
        self
    }

    /// Deliver relayed packets to `sink` instead of dropping them.
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<RelayedPacket>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Like [`IceFactory::create_link`], but keeps the concrete type so
    /// callers can drive gathering and media state by hand.
    pub fn create_loopback(&self, handle_id: u64) -> Arc<LoopbackLink> {
        Arc::new(LoopbackLink::new(
            handle_id,
            self.public_ip,
            self.base_port,
            self.manual_gathering,
            self.sink.clone(),
        ))
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new(IpAddr::from([127, 0, 0, 1]), 10_000)
    }
}

impl IceFactory for LoopbackFactory {
    fn create_link(&self, handle_id: u64) -> Arc<dyn IceLink> {
        self.create_loopback(handle_id)
    }
}

struct StreamTable {
    audio: Option<u32>,
    video: Option<u32>,
    next: u32,
}

/// See [`LoopbackFactory`].
pub struct LoopbackLink {
    handle_id: u64,
    public_ip: IpAddr,
    base_port: u16,
    credentials: IceCredentials,
    streams: Mutex<StreamTable>,
    gathering: watch::Sender<GatheringState>,
    manual_gathering: bool,
    setup_calls: AtomicUsize,
    remote_sdp: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<(u32, u8)>>,
    media_up: AtomicBool,
    sink: Option<mpsc::UnboundedSender<RelayedPacket>>,
}

impl LoopbackLink {
    fn new(
        handle_id: u64,
        public_ip: IpAddr,
        base_port: u16,
        manual_gathering: bool,
        sink: Option<mpsc::UnboundedSender<RelayedPacket>>,
    ) -> Self {
        let tag = ids::random_id();
        Self {
            handle_id,
            public_ip,
            base_port,
            credentials: IceCredentials {
                ufrag: format!("{:08x}", (tag >> 32) as u32),
                pwd: format!("{:016x}{:016x}", tag, tag.rotate_left(17)),
                fingerprint: synth_fingerprint(tag),
            },
            streams: Mutex::new(StreamTable {
                audio: None,
                video: None,
                next: 1,
            }),
            gathering: watch::channel(GatheringState::Idle).0,
            manual_gathering,
            setup_calls: AtomicUsize::new(0),
            remote_sdp: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            media_up: AtomicBool::new(false),
            sink,
        }
    }

    /// How many times `setup_local` ran. The bridge is expected to run it
    /// exactly once per negotiation.
    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_sdp.lock().unwrap().clone()
    }

    /// `(stream, component)` pairs installed by the bridge.
    pub fn installed_remote_candidates(&self) -> Vec<(u32, u8)> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn complete_gathering(&self) {
        self.gathering.send_replace(GatheringState::Complete);
    }

    pub fn fail_gathering(&self) {
        self.gathering.send_replace(GatheringState::Failed);
    }

    /// Mark the media path up, as a connected agent would after DTLS.
    pub fn set_media_up(&self) {
        self.media_up.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IceLink for LoopbackLink {
    fn setup_local(&self, audio: bool, video: bool) {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        let mut table = self.streams.lock().unwrap();
        if audio && table.audio.is_none() {
            table.audio = Some(table.next);
            table.next += 1;
        }
        if video && table.video.is_none() {
            table.video = Some(table.next);
            table.next += 1;
        }
        debug!(
            handle = self.handle_id,
            audio = ?table.audio,
            video = ?table.video,
            "loopback ICE local setup"
        );
        self.gathering.send_replace(if self.manual_gathering {
            GatheringState::InProgress
        } else {
            GatheringState::Complete
        });
    }

    fn audio_stream(&self) -> Option<u32> {
        self.streams.lock().unwrap().audio
    }

    fn video_stream(&self) -> Option<u32> {
        self.streams.lock().unwrap().video
    }

    fn streams(&self) -> u32 {
        let table = self.streams.lock().unwrap();
        table.audio.iter().count() as u32 + table.video.iter().count() as u32
    }

    fn apply_remote_description(&self, sdp: &str) {
        *self.remote_sdp.lock().unwrap() = Some(sdp.to_owned());
    }

    fn add_remote_candidates(&self, stream: u32, component: u8) {
        trace!(handle = self.handle_id, stream, component, "installing remote candidates");
        self.remote_candidates.lock().unwrap().push((stream, component));
    }

    async fn wait_gathering(&self, timeout: Duration) -> Result<(), GatheringError> {
        let mut rx = self.gathering.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *rx.borrow_and_update() {
                GatheringState::Complete => return Ok(()),
                GatheringState::Failed => return Err(GatheringError::Failed),
                GatheringState::Idle | GatheringState::InProgress => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(GatheringError::Failed);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(handle = self.handle_id, "timed out waiting for ICE gathering");
                    return Err(GatheringError::TimedOut);
                }
            }
        }
    }

    fn local_credentials(&self) -> IceCredentials {
        self.credentials.clone()
    }

    fn local_candidates(&self, stream: u32) -> Vec<String> {
        // One synthetic host candidate per component.
        let port = self.base_port + (stream as u16) * 2;
        (1u8..=2)
            .map(|component| {
                format!(
                    "candidate:1 {component} udp 2130706431 {} {} typ host",
                    self.public_ip,
                    port + (component as u16) - 1,
                )
            })
            .collect()
    }

    fn has_media(&self) -> bool {
        self.media_up.load(Ordering::SeqCst)
    }

    fn relay_rtp(&self, video: bool, buf: &[u8]) {
        if !self.has_media() {
            return;
        }
        if let Some(sink) = &self.sink {
            let _ = sink.send(RelayedPacket {
                handle_id: self.handle_id,
                video,
                rtcp: false,
                payload: buf.to_vec(),
            });
        }
    }

    fn relay_rtcp(&self, video: bool, buf: &[u8]) {
        if !self.has_media() {
            return;
        }
        if let Some(sink) = &self.sink {
            let _ = sink.send(RelayedPacket {
                handle_id: self.handle_id,
                video,
                rtcp: true,
                payload: buf.to_vec(),
            });
        }
    }

    fn hangup(&self) {
        self.media_up.store(false, Ordering::SeqCst);
    }
}

fn synth_fingerprint(seed: u64) -> String {
    let bytes = seed.to_be_bytes();
    let mut out = String::with_capacity(32 * 3 - 1);
    for i in 0..32u8 {
        if i > 0 {
            out.push(':');
        }
        let b = bytes[(i % 8) as usize] ^ i.wrapping_mul(41);
        out.push_str(&format!("{b:02X}"));
    }
    out
}
