//! Shared state of the store service.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::session::SessionManager;
use crate::store::MemoryStore;

/// Buffered change notifications per watcher before it starts lagging.
const UPDATE_BUFFER: usize = 64;

/// A write to the store: `(key, value)`.
pub type Update = (String, String);

#[derive(Clone)]
pub struct AppState {
    pub store: MemoryStore,
    pub sessions: SessionManager,
    pub updates: broadcast::Sender<Update>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let store = MemoryStore::new();
        let sessions = SessionManager::new(Arc::new(store.clone()), clock);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            store,
            sessions,
            updates,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
