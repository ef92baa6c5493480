//! Plugin handles: a session's attachment to one plugin instance.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::ice::IceLink;
use crate::plugin::Plugin;

/// A handle binds a session to exactly one plugin for its whole lifetime and
/// owns the (future) WebRTC peer connection through its [`IceLink`].
///
/// The plugin reference is weak: the plugin directory owns plugins, and a
/// handle outliving its plugin (mid-shutdown) must observe that instead of
/// keeping the plugin alive.
pub struct Handle {
    id: u64,
    session_id: u64,
    plugin: Weak<dyn Plugin>,
    package: String,
    ice: Arc<dyn IceLink>,
    /// Opaque per-handle state owned by the plugin, released only through the
    /// plugin's `destroy_session`.
    plugin_state: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    detached: AtomicBool,
}

impl Handle {
    pub(crate) fn new(
        id: u64,
        session_id: u64,
        plugin: &Arc<dyn Plugin>,
        ice: Arc<dyn IceLink>,
    ) -> Self {
        Self {
            id,
            session_id,
            plugin: Arc::downgrade(plugin),
            package: plugin.package().to_owned(),
            ice,
            plugin_state: RwLock::new(None),
            detached: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Package name of the bound plugin, kept for event envelopes even after
    /// the plugin itself has gone away.
    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn plugin(&self) -> Option<Arc<dyn Plugin>> {
        self.plugin.upgrade()
    }

    pub fn ice(&self) -> &Arc<dyn IceLink> {
        &self.ice
    }

    pub fn set_plugin_state(&self, state: Arc<dyn Any + Send + Sync>) {
        *self.plugin_state.write().unwrap() = Some(state);
    }

    /// Fetch the plugin-side state, downcast to the plugin's own type.
    pub fn plugin_state<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let slot = self.plugin_state.read().unwrap();
        slot.as_ref().and_then(|state| state.clone().downcast::<T>().ok())
    }

    pub fn clear_plugin_state(&self) {
        *self.plugin_state.write().unwrap() = None;
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("session", &self.session_id)
            .field("plugin", &self.package)
            .finish()
    }
}
