//! # Janus Gateway Core
//!
//! The signaling session manager and plugin dispatch fabric of the gateway:
//!
//! - Session and handle registries with random 64-bit identifiers
//! - Per-session event queues drained by long-poll readers
//! - The JSON control protocol dispatcher and its error envelope
//! - The plugin host contract and per-plugin message workers
//! - The SDP negotiation bridge coupling plugin JSEP exchanges to ICE
//! - RTCP REMB construction and capping for bitrate control
//!
//! The ICE/DTLS transport, full SDP parser, and HTTP server are external
//! collaborators reached through the seams in [`ice`] and [`dispatcher`];
//! plugins implement [`plugin::Plugin`] and talk back through [`Gateway`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handle;
pub mod ice;
pub mod ids;
pub mod jsep;
pub mod plugin;
pub mod rtcp;
pub mod session;

pub use config::GatewayConfig;
pub use dispatcher::{Dispatcher, RequestScope};
pub use error::{ApiError, Error, Result};
pub use gateway::Gateway;
pub use handle::Handle;
pub use jsep::{Jsep, SdpKind};
pub use plugin::{InboundMessage, Plugin, PluginHost};
pub use session::{Session, SessionRegistry};
