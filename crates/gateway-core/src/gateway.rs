//! The gateway callback surface and session/handle lifecycle.
//!
//! [`Gateway`] owns the session registry and the ICE factory, and implements
//! the three callbacks handed to plugins at init: `push_event`, `relay_rtp`,
//! and `relay_rtcp`. Lifecycle mutations hold registry locks only for the
//! map operation itself; plugin callbacks always run outside the locks.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::events::PendingEvent;
use crate::handle::Handle;
use crate::ice::IceFactory;
use crate::ids;
use crate::jsep::{self, Jsep};
use crate::plugin::Plugin;
use crate::session::{Session, SessionRegistry};

/// Default wait for ICE candidate gathering during outbound negotiation.
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Gateway {
    sessions: SessionRegistry,
    ice: Arc<dyn IceFactory>,
    stop: CancellationToken,
    gathering_timeout: Duration,
    public_ip: Option<IpAddr>,
}

impl Gateway {
    pub fn new(ice: Arc<dyn IceFactory>, stop: CancellationToken) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            ice,
            stop,
            gathering_timeout: DEFAULT_GATHERING_TIMEOUT,
            public_ip: None,
        }
    }

    /// Address advertised in merged SDP instead of the local one.
    pub fn with_public_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.public_ip = ip;
        self
    }

    pub fn with_gathering_timeout(mut self, timeout: Duration) -> Self {
        self.gathering_timeout = timeout;
        self
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    // ---- session lifecycle ----

    pub fn create_session(&self) -> Arc<Session> {
        self.sessions.create()
    }

    pub fn find_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.find(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Tear a session down: mark it destroyed first so in-flight work
    /// observes a consistent going-away state, then detach every handle,
    /// then unlink the session itself.
    pub async fn destroy_session(&self, id: u64) -> Result<(), ApiError> {
        let session = self
            .sessions
            .find(id)
            .ok_or(ApiError::SessionNotFound(id))?;
        session.mark_destroyed();
        let handles: Vec<Arc<Handle>> =
            session.handles().iter().map(|h| h.value().clone()).collect();
        for handle in handles {
            if let Err(e) = self.teardown_handle(&session, handle).await {
                warn!(session = id, error = %e, "handle teardown failed during session destroy");
            }
        }
        self.sessions.remove(id);
        info!(session = id, "session destroyed");
        Ok(())
    }

    // ---- handle lifecycle ----

    /// Attach a session to a plugin: allocate the handle, create its ICE
    /// context, and hand it to the plugin. The handle is unlinked again if
    /// the plugin refuses it.
    pub async fn attach_handle(
        &self,
        session: &Arc<Session>,
        plugin: Arc<dyn Plugin>,
    ) -> Result<Arc<Handle>, ApiError> {
        let mut created: Option<Arc<Handle>> = None;
        let handle_id = ids::insert_unique(session.handles(), |id| {
            let link = self.ice.create_link(id);
            let handle = Arc::new(Handle::new(id, session.id(), &plugin, link));
            created = Some(handle.clone());
            handle
        });
        let handle = created.expect("insert_unique always runs the builder");
        if let Err(e) = plugin.create_session(handle.clone()).await {
            session.handles().remove(&handle_id);
            return Err(ApiError::PluginAttach(e.to_string()));
        }
        debug!(
            session = session.id(),
            handle = handle_id,
            plugin = plugin.package(),
            "handle attached"
        );
        Ok(handle)
    }

    pub async fn detach_handle(
        &self,
        session: &Arc<Session>,
        handle_id: u64,
    ) -> Result<(), ApiError> {
        let handle = session
            .find_handle(handle_id)
            .ok_or(ApiError::HandleNotFound {
                handle: handle_id,
                session: session.id(),
            })?;
        self.teardown_handle(session, handle).await
    }

    async fn teardown_handle(
        &self,
        session: &Arc<Session>,
        handle: Arc<Handle>,
    ) -> Result<(), ApiError> {
        handle.mark_detached();
        handle.ice().hangup();
        let result = match handle.plugin() {
            None => Err(ApiError::PluginDetach("no plugin attached".to_owned())),
            Some(plugin) => plugin
                .destroy_session(handle.clone())
                .await
                .map_err(|e| ApiError::PluginDetach(e.to_string())),
        };
        session.handles().remove(&handle.id());
        handle.clear_plugin_state();
        debug!(session = session.id(), handle = handle.id(), "handle detached");
        result
    }

    // ---- plugin callbacks ----

    /// Push an asynchronous plugin event to the browser. The body must be a
    /// JSON object; a supplied JSEP is run through the SDP bridge and
    /// attached to the envelope. The completed event lands on the session's
    /// long-poll queue.
    pub async fn push_event(
        &self,
        handle: &Arc<Handle>,
        plugin: &dyn Plugin,
        transaction: Option<&str>,
        data: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), ApiError> {
        let session = self
            .find_session(handle.session_id())
            .ok_or(ApiError::SessionNotFound(handle.session_id()))?;
        if !data.is_object() {
            return Err(ApiError::InvalidJsonObject("JSON error: not an object"));
        }
        let jsep_out = match jsep {
            Some(j) => Some(
                jsep::process_outgoing(handle, &j, self.gathering_timeout, self.public_ip).await?,
            ),
            None => None,
        };
        let mut event = json!({
            "janus": "event",
            "sender": handle.id(),
            "plugindata": {
                "plugin": plugin.package(),
                "data": data,
            },
        });
        if let Some(t) = transaction {
            event["transaction"] = Value::String(t.to_owned());
        }
        if let Some(j) = jsep_out {
            event["jsep"] = serde_json::to_value(j).map_err(|e| ApiError::Unknown(e.to_string()))?;
        }
        debug!(
            session = session.id(),
            handle = handle.id(),
            plugin = plugin.package(),
            "queueing plugin event"
        );
        session.events().enqueue(PendingEvent::new(event.to_string()));
        Ok(())
    }

    /// Egress an RTP packet for a handle. Blackhole without active media or
    /// once the handle started detaching.
    pub fn relay_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        if handle.is_detached() {
            return;
        }
        handle.ice().relay_rtp(video, buf);
    }

    /// Egress an RTCP packet for a handle.
    pub fn relay_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        if handle.is_detached() {
            return;
        }
        handle.ice().relay_rtcp(video, buf);
    }
}
