//! Pair-matching videocall plugin.
//!
//! Two browsers attach, register a username each, and call each other
//! through the gateway: all RTP/RTCP arriving from one peer is relayed to
//! the other. Knobs control whether audio/video is muted and whether the
//! peer's video bitrate should be capped with REMB feedback.
//!
//! Request verbs (in `message.body.request`): `list`, `register`, `call`,
//! `accept`, `set`, `hangup`. Success events are pushed as
//! `{"videocall":"event","result":{...}}`, failures as
//! `{"videocall":"event","error":"..."}`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use janus_gateway_core::error::{Error, Result};
use janus_gateway_core::plugin::{InboundMessage, Plugin};
use janus_gateway_core::{rtcp, Gateway, Handle, Jsep};

pub const VIDEOCALL_VERSION: u32 = 1;
pub const VIDEOCALL_VERSION_STRING: &str = "0.1.0";
pub const VIDEOCALL_NAME: &str = "Janus VideoCall plugin";
pub const VIDEOCALL_DESCRIPTION: &str =
    "Simple video call plugin: two WebRTC peers call each other through the gateway";
pub const VIDEOCALL_PACKAGE: &str = "janus.plugin.videocall";

/// Per-handle plugin state.
///
/// `handle` and `peer` are weak: the gateway owns handles, and peer links
/// must never keep a destroyed session alive. Peer links are symmetric and
/// only ever changed under the plugin's pairing lock.
pub struct VideoCallSession {
    handle: Weak<Handle>,
    username: RwLock<Option<String>>,
    audio_active: AtomicBool,
    video_active: AtomicBool,
    /// Outbound video bitrate cap in bit/s; 0 means no cap.
    bitrate: AtomicU64,
    peer: Mutex<Weak<VideoCallSession>>,
    destroyed: AtomicBool,
}

impl VideoCallSession {
    fn new(handle: &Arc<Handle>) -> Self {
        Self {
            handle: Arc::downgrade(handle),
            username: RwLock::new(None),
            audio_active: AtomicBool::new(true),
            video_active: AtomicBool::new(true),
            bitrate: AtomicU64::new(0),
            peer: Mutex::new(Weak::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().unwrap().clone()
    }

    pub fn audio_active(&self) -> bool {
        self.audio_active.load(Ordering::SeqCst)
    }

    pub fn video_active(&self) -> bool {
        self.video_active.load(Ordering::SeqCst)
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> Option<Arc<VideoCallSession>> {
        self.peer.lock().unwrap().upgrade()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn handle(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    /// Back to post-hangup defaults.
    fn reset_controls(&self) {
        self.audio_active.store(true, Ordering::SeqCst);
        self.video_active.store(true, Ordering::SeqCst);
        self.bitrate.store(0, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct VideoCallPlugin {
    gateway: OnceLock<Arc<Gateway>>,
    /// Registered username -> session. A username uniquely resolves to one
    /// live handle.
    usernames: DashMap<String, Arc<VideoCallSession>>,
    /// Serializes peer link/unlink so the two directions change atomically.
    pairing: Mutex<()>,
    stopping: AtomicBool,
}

impl VideoCallPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn gateway(&self) -> Option<&Arc<Gateway>> {
        self.gateway.get()
    }

    fn session_of(&self, handle: &Arc<Handle>) -> Option<Arc<VideoCallSession>> {
        handle.plugin_state::<VideoCallSession>()
    }

    async fn push_result(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        result: Value,
        jsep: Option<Jsep>,
    ) {
        let Some(gateway) = self.gateway() else { return };
        let data = json!({ "videocall": "event", "result": result });
        if let Err(e) = gateway.push_event(handle, self, transaction, data, jsep).await {
            warn!(handle = handle.id(), error = %e, "failed to push videocall event");
        }
    }

    async fn push_error(&self, handle: &Arc<Handle>, transaction: Option<&str>, cause: &str) {
        let Some(gateway) = self.gateway() else { return };
        let data = json!({ "videocall": "event", "error": cause });
        if let Err(e) = gateway.push_event(handle, self, transaction, data, None).await {
            warn!(handle = handle.id(), error = %e, "failed to push videocall error");
        }
    }

    /// Unlink a call pair, both directions under the pairing lock. Returns
    /// the former peer, if there was one.
    fn unlink_peer(&self, session: &Arc<VideoCallSession>) -> Option<Arc<VideoCallSession>> {
        let _pairing = self.pairing.lock().unwrap();
        let peer = session.peer.lock().unwrap().upgrade();
        *session.peer.lock().unwrap() = Weak::new();
        if let Some(peer) = &peer {
            *peer.peer.lock().unwrap() = Weak::new();
        }
        peer
    }

    /// The `register` verb.
    fn register(&self, session: &Arc<VideoCallSession>, body: &Value) -> VerbResult {
        if let Some(taken) = session.username() {
            return Err(format!("Already registered ({taken})"));
        }
        let Some(username) = body.get("username").and_then(Value::as_str) else {
            return Err("JSON error: missing element (username)".to_owned());
        };
        match self.usernames.entry(username.to_owned()) {
            Entry::Occupied(_) => return Err(format!("Username '{username}' already taken")),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        *session.username.write().unwrap() = Some(username.to_owned());
        info!(username = %username, "videocall user registered");
        Ok(Some(Reply {
            result: json!({ "event": "registered", "username": username }),
            peer_event: None,
        }))
    }

    /// The `call` verb.
    fn call(
        &self,
        session: &Arc<VideoCallSession>,
        body: &Value,
        jsep: Option<&Jsep>,
    ) -> VerbResult {
        if session.peer().is_some() {
            return Err("Already in a call".to_owned());
        }
        let Some(username) = body.get("username").and_then(Value::as_str) else {
            return Err("JSON error: missing element (username)".to_owned());
        };
        let Some(callee) = self.usernames.get(username).map(|s| s.clone()) else {
            return Err(format!("Username '{username}' doesn't exist"));
        };
        let caller_name = session.username().unwrap_or_default();
        let _pairing = self.pairing.lock().unwrap();
        if callee.peer.lock().unwrap().upgrade().is_some() {
            info!(username = %username, "videocall target is busy");
            return Ok(Some(Reply {
                result: json!({
                    "event": "hangup",
                    "username": caller_name,
                    "reason": "User busy",
                }),
                peer_event: None,
            }));
        }
        let Some(jsep) = jsep else {
            return Err("Missing SDP".to_owned());
        };
        *session.peer.lock().unwrap() = Arc::downgrade(&callee);
        *callee.peer.lock().unwrap() = Arc::downgrade(session);
        info!(caller = %caller_name, callee = %username, "videocall ringing");
        Ok(Some(Reply {
            result: json!({ "event": "calling" }),
            peer_event: Some(PeerEvent {
                target: callee,
                result: json!({ "event": "incomingcall", "username": caller_name }),
                jsep: Some(jsep.clone()),
            }),
        }))
    }

    /// The `accept` verb.
    fn accept(&self, session: &Arc<VideoCallSession>, jsep: Option<&Jsep>) -> VerbResult {
        let Some(peer) = session.peer() else {
            return Err("No incoming call to accept".to_owned());
        };
        let Some(jsep) = jsep else {
            return Err("Missing SDP".to_owned());
        };
        let callee_name = session.username().unwrap_or_default();
        info!(callee = %callee_name, "videocall accepted");
        Ok(Some(Reply {
            result: json!({ "event": "accepted" }),
            peer_event: Some(PeerEvent {
                target: peer,
                result: json!({ "event": "accepted", "username": callee_name }),
                jsep: Some(jsep.clone()),
            }),
        }))
    }

    /// The `set` verb: mute/unmute and bitrate cap updates.
    fn set(&self, session: &Arc<VideoCallSession>, body: &Value) -> VerbResult {
        let audio = match body.get("audio") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return Err("JSON error: invalid value (audio)".to_owned()),
        };
        let video = match body.get("video") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return Err("JSON error: invalid value (video)".to_owned()),
        };
        let bitrate = match body.get("bitrate") {
            None => None,
            Some(v) => match v.as_u64() {
                Some(b) => Some(b),
                None => return Err("JSON error: invalid value (bitrate)".to_owned()),
            },
        };
        if let Some(audio) = audio {
            session.audio_active.store(audio, Ordering::SeqCst);
            debug!(audio, "setting audio property");
        }
        if let Some(video) = video {
            session.video_active.store(video, Ordering::SeqCst);
            debug!(video, "setting video property");
        }
        if let Some(bitrate) = bitrate {
            session.bitrate.store(bitrate, Ordering::SeqCst);
            debug!(bitrate, "setting video bitrate cap");
            if bitrate > 0 {
                // Synthesize a REMB right away; some senders never emit one
                // we could cap on the relay path.
                if let (Some(gateway), Some(handle)) = (self.gateway(), session.handle()) {
                    let packet = rtcp::remb(bitrate);
                    gateway.relay_rtcp(&handle, true, &packet);
                }
            }
            // A zero bitrate clears the cap; relayed RTCP passes through
            // untouched from here on.
        }
        Ok(Some(Reply {
            result: json!({ "event": "set" }),
            peer_event: None,
        }))
    }

    /// The `hangup` verb. Hanging up without a peer is silently ignored.
    fn hangup(&self, session: &Arc<VideoCallSession>) -> VerbResult {
        let Some(peer) = self.unlink_peer(session) else {
            debug!("no call to hangup");
            return Ok(None);
        };
        let username = session.username().unwrap_or_default();
        info!(username = %username, "videocall hangup");
        Ok(Some(Reply {
            result: json!({
                "event": "hangup",
                "username": username,
                "reason": "We did the hangup",
            }),
            peer_event: Some(PeerEvent {
                target: peer,
                result: json!({
                    "event": "hangup",
                    "username": username,
                    "reason": "Remote hangup",
                }),
                jsep: None,
            }),
        }))
    }

    fn list(&self) -> VerbResult {
        let list: Vec<String> = self.usernames.iter().map(|e| e.key().clone()).collect();
        Ok(Some(Reply {
            result: json!({ "list": list }),
            peer_event: None,
        }))
    }
}

/// An event for the other end of a call pair.
struct PeerEvent {
    target: Arc<VideoCallSession>,
    result: Value,
    jsep: Option<Jsep>,
}

/// What a verb produced: the result for the requester and optionally an
/// event for the peer. `Ok(None)` means stay silent.
struct Reply {
    result: Value,
    peer_event: Option<PeerEvent>,
}

type VerbResult = std::result::Result<Option<Reply>, String>;

#[async_trait]
impl Plugin for VideoCallPlugin {
    fn version(&self) -> u32 {
        VIDEOCALL_VERSION
    }

    fn version_string(&self) -> &str {
        VIDEOCALL_VERSION_STRING
    }

    fn name(&self) -> &str {
        VIDEOCALL_NAME
    }

    fn description(&self) -> &str {
        VIDEOCALL_DESCRIPTION
    }

    fn package(&self) -> &str {
        VIDEOCALL_PACKAGE
    }

    async fn init(&self, gateway: Arc<Gateway>, config_dir: &Path) -> Result<()> {
        let config_file = config_dir.join(format!("{VIDEOCALL_PACKAGE}.cfg"));
        if config_file.exists() {
            // Nothing to configure yet; the file is accepted for parity with
            // other plugins.
            debug!(path = %config_file.display(), "videocall config present");
        }
        self.gateway
            .set(gateway)
            .map_err(|_| Error::Plugin("videocall plugin initialized twice".to_owned()))?;
        info!("{VIDEOCALL_NAME} initialized");
        Ok(())
    }

    async fn destroy(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.usernames.clear();
        info!("{VIDEOCALL_NAME} destroyed");
    }

    async fn create_session(&self, handle: Arc<Handle>) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::Plugin("plugin is stopping".to_owned()));
        }
        let session = Arc::new(VideoCallSession::new(&handle));
        handle.set_plugin_state(session);
        debug!(handle = handle.id(), "videocall session created");
        Ok(())
    }

    async fn destroy_session(&self, handle: Arc<Handle>) -> Result<()> {
        let Some(session) = self.session_of(&handle) else {
            return Err(Error::Plugin("no session associated with this handle".to_owned()));
        };
        if session.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(peer) = self.unlink_peer(&session) {
            if let Some(peer_handle) = peer.handle() {
                let result = json!({
                    "event": "hangup",
                    "username": session.username().unwrap_or_default(),
                    "reason": "Remote hangup",
                });
                self.push_result(&peer_handle, None, result, None).await;
            }
        }
        if let Some(username) = session.username() {
            self.usernames
                .remove_if(&username, |_, s| Arc::ptr_eq(s, &session));
            info!(username = %username, "videocall user removed");
        }
        Ok(())
    }

    async fn handle_message(&self, message: InboundMessage) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let handle = message.handle.clone();
        let Some(session) = self.session_of(&handle) else {
            warn!(handle = handle.id(), "message for a handle with no videocall session");
            return;
        };
        if session.is_destroyed() {
            return;
        }
        let transaction = message.transaction.as_deref();
        let Some(request) = message.body.get("request").and_then(Value::as_str) else {
            self.push_error(&handle, transaction, "JSON error: invalid element (request)")
                .await;
            return;
        };
        debug!(handle = handle.id(), request, "handling videocall request");
        let outcome = match request {
            "list" => self.list(),
            "register" => self.register(&session, &message.body),
            "call" => self.call(&session, &message.body, message.jsep.as_ref()),
            "accept" => self.accept(&session, message.jsep.as_ref()),
            "set" => self.set(&session, &message.body),
            "hangup" => self.hangup(&session),
            other => Err(format!("Unknown request ({other})")),
        };
        match outcome {
            Err(cause) => self.push_error(&handle, transaction, &cause).await,
            Ok(None) => {}
            Ok(Some(reply)) => {
                if let Some(peer_event) = reply.peer_event {
                    if let Some(peer_handle) = peer_event.target.handle() {
                        self.push_result(&peer_handle, None, peer_event.result, peer_event.jsep)
                            .await;
                    }
                }
                self.push_result(&handle, transaction, reply.result, None).await;
            }
        }
    }

    async fn setup_media(&self, handle: Arc<Handle>) {
        // Nothing to do: the plugin only relays what it receives.
        debug!(handle = handle.id(), "videocall media is up");
    }

    async fn hangup_media(&self, handle: Arc<Handle>) {
        let Some(session) = self.session_of(&handle) else { return };
        if session.is_destroyed() {
            return;
        }
        if let Some(peer) = self.unlink_peer(&session) {
            if let Some(peer_handle) = peer.handle() {
                let result = json!({
                    "event": "hangup",
                    "username": session.username().unwrap_or_default(),
                    "reason": "Remote hangup",
                });
                self.push_result(&peer_handle, None, result, None).await;
            }
        }
        session.reset_controls();
        debug!(handle = handle.id(), "videocall media torn down");
    }

    fn incoming_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        let Some(gateway) = self.gateway() else { return };
        let Some(session) = self.session_of(handle) else { return };
        let Some(peer) = session.peer() else { return };
        if session.is_destroyed() || peer.is_destroyed() {
            return;
        }
        // Honour the mute flags: dropped here, not at the peer.
        let active = if video {
            session.video_active()
        } else {
            session.audio_active()
        };
        if !active {
            return;
        }
        if let Some(peer_handle) = peer.handle() {
            gateway.relay_rtp(&peer_handle, video, buf);
        }
    }

    fn incoming_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &mut [u8]) {
        let Some(gateway) = self.gateway() else { return };
        let Some(session) = self.session_of(handle) else { return };
        let Some(peer) = session.peer() else { return };
        if session.is_destroyed() || peer.is_destroyed() {
            return;
        }
        let cap = session.bitrate();
        if cap > 0 {
            rtcp::cap_remb(buf, cap);
        }
        if let Some(peer_handle) = peer.handle() {
            gateway.relay_rtcp(&peer_handle, video, buf);
        }
    }
}
