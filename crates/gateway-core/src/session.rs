//! Gateway sessions and the process-wide session registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::events::EventQueue;
use crate::handle::Handle;
use crate::ids;

/// One browser's control-plane context: an identifier, the queue its
/// long-polls drain, and the handles it has attached to plugins.
pub struct Session {
    id: u64,
    events: EventQueue,
    handles: DashMap<u64, Arc<Handle>>,
    destroyed: AtomicBool,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            events: EventQueue::new(),
            handles: DashMap::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Set once teardown has begun. In-flight workers and relays check this
    /// and skip their work instead of touching a session that is going away.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn find_handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.get(&handle_id).map(|h| h.clone())
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn handles(&self) -> &DashMap<u64, Arc<Handle>> {
        &self.handles
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("handles", &self.handles.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Concurrent map of live sessions keyed by identifier.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session under a new unique identifier.
    pub fn create(&self) -> Arc<Session> {
        let mut created: Option<Arc<Session>> = None;
        let id = ids::insert_unique(&self.sessions, |id| {
            let session = Arc::new(Session::new(id));
            created = Some(session.clone());
            session
        });
        info!(session = id, "created new session");
        created.expect("insert_unique always runs the builder")
    }

    pub fn find(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Unlink a session. The caller is responsible for having marked it
    /// destroyed and detached its handles first.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
