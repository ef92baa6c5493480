//! Error types for the gateway core.
//!
//! Two families live here: [`ApiError`], the protocol-level errors that are
//! serialized into the JSON error envelope and returned to clients with
//! HTTP 200, and [`Error`], the internal errors that never cross the wire.

use serde_json::{json, Value};
use thiserror::Error;

/// Protocol-level error, carrying the numeric code and reason string of the
/// control API. The code range 450-465 is contiguous; 490 is the catch-all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Use POST to create a session")]
    UsePost,

    #[error("JSON error: missing request")]
    MissingRequest,

    #[error("Unknown request '{0}'")]
    UnknownRequest(String),

    /// Body was not parseable JSON; carries the position info of the parser.
    #[error("JSON error: on line {line}: {text}")]
    InvalidJson { line: usize, text: String },

    /// Parsed, but the wrong shape. The reason text varies by context
    /// ("not an object", "Invalid body object", "Invalid jsep object").
    #[error("{0}")]
    InvalidJsonObject(&'static str),

    #[error("JSON error: missing mandatory element ({0})")]
    MissingElement(&'static str),

    #[error("JSEP error: missing mandatory element ({0})")]
    MissingJsepElement(&'static str),

    #[error("Unhandled request '{0}' at this path")]
    InvalidRequestPath(String),

    #[error("No such session {0}")]
    SessionNotFound(u64),

    #[error("No such handle {handle} in session {session}")]
    HandleNotFound { handle: u64, session: u64 },

    #[error("No such plugin '{0}'")]
    PluginNotFound(String),

    #[error("Couldn't attach to plugin: {0}")]
    PluginAttach(String),

    #[error("No plugin to handle this message")]
    PluginMessage,

    #[error("Couldn't detach from plugin: {0}")]
    PluginDetach(String),

    #[error("JSEP error: unknown message type '{0}'")]
    JsepUnknownType(String),

    #[error("JSEP error: invalid SDP")]
    JsepInvalidSdp,

    #[error("{0}")]
    Unknown(String),
}

impl ApiError {
    /// The numeric code carried in the error envelope.
    pub fn code(&self) -> u16 {
        match self {
            ApiError::UsePost => 450,
            ApiError::MissingRequest => 452,
            ApiError::UnknownRequest(_) => 453,
            ApiError::InvalidJson { .. } => 454,
            ApiError::InvalidJsonObject(_) => 455,
            ApiError::MissingElement(_) | ApiError::MissingJsepElement(_) => 456,
            ApiError::InvalidRequestPath(_) => 457,
            ApiError::SessionNotFound(_) => 458,
            ApiError::HandleNotFound { .. } => 459,
            ApiError::PluginNotFound(_) => 460,
            ApiError::PluginAttach(_) => 461,
            ApiError::PluginMessage => 462,
            ApiError::PluginDetach(_) => 463,
            ApiError::JsepUnknownType(_) => 464,
            ApiError::JsepInvalidSdp => 465,
            ApiError::Unknown(_) => 490,
        }
    }

    /// Wrap this error in the JSON envelope returned to clients.
    pub fn envelope(&self, transaction: Option<&str>) -> Value {
        let mut reply = json!({
            "janus": "error",
            "error": {
                "code": self.code(),
                "reason": self.to_string(),
            }
        });
        if let Some(t) = transaction {
            reply["transaction"] = Value::String(t.to_owned());
        }
        reply
    }

    /// Build an [`ApiError::InvalidJson`] from a serde parse failure.
    pub fn from_json(err: &serde_json::Error) -> Self {
        ApiError::InvalidJson {
            line: err.line(),
            text: err.to_string(),
        }
    }
}

/// Internal gateway errors. These stay inside the process; when one surfaces
/// on a protocol path it is mapped to [`ApiError::Unknown`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("plugin '{0}' failed to initialize: {1}")]
    PluginInit(String, String),

    #[error("duplicate plugin package '{0}'")]
    DuplicatePlugin(String),

    #[error("invalid plugin metadata: {0}")]
    PluginMetadata(String),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),

    /// A failure raised inside a plugin entry point.
    #[error("{0}")]
    Plugin(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_contiguous_where_assigned() {
        assert_eq!(ApiError::UsePost.code(), 450);
        assert_eq!(ApiError::MissingRequest.code(), 452);
        assert_eq!(ApiError::SessionNotFound(1).code(), 458);
        assert_eq!(ApiError::JsepInvalidSdp.code(), 465);
        assert_eq!(ApiError::Unknown("x".into()).code(), 490);
    }

    #[test]
    fn envelope_includes_transaction_when_known() {
        let err = ApiError::SessionNotFound(42);
        let env = err.envelope(Some("t1"));
        assert_eq!(env["janus"], "error");
        assert_eq!(env["transaction"], "t1");
        assert_eq!(env["error"]["code"], 458);
        assert_eq!(env["error"]["reason"], "No such session 42");

        let env = err.envelope(None);
        assert!(env.get("transaction").is_none());
    }
}
