//! The JSON control protocol dispatcher.
//!
//! One entry point per request shape: [`Dispatcher::handle_post`] for
//! commands and [`Dispatcher::long_poll`] for the GET notification channel.
//! The transport layer decodes the URL into a [`RequestScope`] and ships the
//! raw body here; everything protocol-level (parsing, validation, routing,
//! envelope formatting) happens in this module. Protocol errors are replies,
//! not transport failures: every outcome serializes to a 200 body.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::events::KEEPALIVE;
use crate::gateway::Gateway;
use crate::handle::Handle;
use crate::jsep::{self, Jsep, SdpKind};
use crate::plugin::{InboundMessage, PluginHost};
use crate::session::Session;

/// How long a long poll waits on an empty queue before yielding a keepalive.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// The path scope a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    /// `POST <base>/`, before any session exists.
    Root,
    /// `<base>/<session>`.
    Session(u64),
    /// `<base>/<session>/<handle>`.
    Handle { session: u64, handle: u64 },
}

pub struct Dispatcher {
    gateway: Arc<Gateway>,
    plugins: Arc<PluginHost>,
    poll_timeout: Duration,
}

impl Dispatcher {
    pub fn new(gateway: Arc<Gateway>, plugins: Arc<PluginHost>) -> Self {
        Self {
            gateway,
            plugins,
            poll_timeout: LONG_POLL_TIMEOUT,
        }
    }

    /// Shorten the long-poll wait; tests use this to avoid 30 s sleeps.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Drain one event from the session's queue, blocking up to the poll
    /// timeout. Returns the serialized reply body.
    pub async fn long_poll(&self, session_id: u64) -> String {
        let Some(session) = self.gateway.find_session(session_id) else {
            return ApiError::SessionNotFound(session_id).envelope(None).to_string();
        };
        debug!(session = session_id, "long poll waiting");
        match session
            .events()
            .poll(self.poll_timeout, self.gateway.stop_token())
            .await
        {
            Some(event) => event.into_payload(),
            None => KEEPALIVE.to_owned(),
        }
    }

    /// Process one POSTed command and return the serialized reply body.
    pub async fn handle_post(&self, scope: RequestScope, payload: &str) -> String {
        match self.post_inner(scope, payload).await {
            Ok(reply) => reply.to_string(),
            Err((err, transaction)) => err.envelope(transaction.as_deref()).to_string(),
        }
    }

    async fn post_inner(
        &self,
        scope: RequestScope,
        payload: &str,
    ) -> Result<Value, (ApiError, Option<String>)> {
        if payload.trim().is_empty() {
            return Err((ApiError::MissingRequest, None));
        }
        let root: Value =
            serde_json::from_str(payload).map_err(|e| (ApiError::from_json(&e), None))?;
        let Some(request) = root.as_object() else {
            return Err((ApiError::InvalidJsonObject("JSON error: not an object"), None));
        };
        let Some(transaction) = request.get("transaction").and_then(Value::as_str) else {
            return Err((ApiError::MissingElement("transaction"), None));
        };
        let transaction = transaction.to_owned();
        let Some(command) = request.get("janus").and_then(Value::as_str) else {
            return Err((ApiError::MissingElement("janus"), Some(transaction)));
        };
        let fail = |err: ApiError| (err, Some(transaction.clone()));

        match scope {
            RequestScope::Root => match command {
                "create" => {
                    let session = self.gateway.create_session();
                    Ok(success(&transaction, Some(json!({ "id": session.id() }))))
                }
                other => Err(fail(ApiError::InvalidRequestPath(other.to_owned()))),
            },
            RequestScope::Session(session_id) => {
                let session = self
                    .gateway
                    .find_session(session_id)
                    .ok_or_else(|| fail(ApiError::SessionNotFound(session_id)))?;
                match command {
                    "attach" => self
                        .attach(&session, request, &transaction)
                        .await
                        .map_err(fail),
                    "destroy" => {
                        self.gateway
                            .destroy_session(session_id)
                            .await
                            .map_err(fail)?;
                        Ok(success(&transaction, None))
                    }
                    "detach" | "message" => {
                        Err(fail(ApiError::InvalidRequestPath(command.to_owned())))
                    }
                    other => Err(fail(ApiError::UnknownRequest(other.to_owned()))),
                }
            }
            RequestScope::Handle { session, handle } => {
                let session_id = session;
                let session = self
                    .gateway
                    .find_session(session_id)
                    .ok_or_else(|| fail(ApiError::SessionNotFound(session_id)))?;
                let handle_id = handle;
                let handle =
                    session
                        .find_handle(handle_id)
                        .ok_or_else(|| fail(ApiError::HandleNotFound {
                            handle: handle_id,
                            session: session_id,
                        }))?;
                match command {
                    "attach" | "destroy" => {
                        Err(fail(ApiError::InvalidRequestPath(command.to_owned())))
                    }
                    "detach" => {
                        self.gateway
                            .detach_handle(&session, handle_id)
                            .await
                            .map_err(fail)?;
                        Ok(success(&transaction, None))
                    }
                    "message" => self
                        .message(&handle, request, &transaction)
                        .map_err(fail),
                    other => Err(fail(ApiError::UnknownRequest(other.to_owned()))),
                }
            }
        }
    }

    async fn attach(
        &self,
        session: &Arc<Session>,
        request: &Map<String, Value>,
        transaction: &str,
    ) -> Result<Value, ApiError> {
        let Some(package) = request.get("plugin").and_then(Value::as_str) else {
            return Err(ApiError::MissingElement("plugin"));
        };
        let plugin = self
            .plugins
            .find(package)
            .ok_or_else(|| ApiError::PluginNotFound(package.to_owned()))?;
        let handle = self.gateway.attach_handle(session, plugin).await?;
        info!(
            session = session.id(),
            handle = handle.id(),
            plugin = package,
            "attached to plugin"
        );
        Ok(success(transaction, Some(json!({ "id": handle.id() }))))
    }

    /// Route a `message` to the handle's plugin: validate the body, run SDP
    /// pre-processing when a JSEP is attached, queue for the plugin worker,
    /// and acknowledge immediately. The real reply arrives asynchronously on
    /// the session's event queue.
    fn message(
        &self,
        handle: &Arc<Handle>,
        request: &Map<String, Value>,
        transaction: &str,
    ) -> Result<Value, ApiError> {
        if handle.plugin().is_none() {
            return Err(ApiError::PluginMessage);
        }
        let Some(body) = request.get("body") else {
            return Err(ApiError::MissingElement("body"));
        };
        if !body.is_object() {
            return Err(ApiError::InvalidJsonObject("Invalid body object"));
        }
        let jsep = match request.get("jsep") {
            None => None,
            Some(jsep) => Some(self.preprocess_jsep(handle, jsep)?),
        };
        let message = InboundMessage {
            handle: handle.clone(),
            transaction: Some(transaction.to_owned()),
            body: body.clone(),
            jsep,
        };
        self.plugins
            .dispatch(handle.package(), message)
            .map_err(|_| ApiError::PluginMessage)?;
        Ok(json!({ "janus": "ack", "transaction": transaction }))
    }

    fn preprocess_jsep(&self, handle: &Arc<Handle>, jsep: &Value) -> Result<Jsep, ApiError> {
        let Some(jsep) = jsep.as_object() else {
            return Err(ApiError::InvalidJsonObject("Invalid jsep object"));
        };
        let Some(kind) = jsep.get("type").and_then(Value::as_str) else {
            return Err(ApiError::MissingJsepElement("type"));
        };
        let kind =
            SdpKind::parse(kind).ok_or_else(|| ApiError::JsepUnknownType(kind.to_owned()))?;
        let Some(sdp) = jsep.get("sdp").and_then(Value::as_str) else {
            return Err(ApiError::MissingJsepElement("sdp"));
        };
        debug!(handle = handle.id(), kind = kind.as_str(), "processing remote jsep");
        let anonymized = jsep::process_incoming(handle, kind, sdp)?;
        Ok(Jsep {
            kind,
            sdp: anonymized,
        })
    }
}

fn success(transaction: &str, data: Option<Value>) -> Value {
    let mut reply = json!({
        "janus": "success",
        "transaction": transaction,
    });
    if let Some(data) = data {
        reply["data"] = data;
    }
    reply
}
