//! # Session Store
//!
//! The map from session id to [`Session`], behind a trait so eviction policy and
//! storage can be swapped and tests can watch what the runtime does with it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use dashmap::DashMap;

use crate::session::InitError;
use crate::session::Session;

pub type Create<'a> = Box<dyn FnOnce() -> Result<Session, InitError> + Send + 'a>;

pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, id: &str) -> Option<Arc<Session>>;

    /// Returns the cached session, or caches what `create` builds.
    ///
    /// `create` runs at most once per call and only when the id is absent. A
    /// concurrent call for the same id must observe either nothing or the
    /// finished session, never a half-built one. The flag is `true` when this
    /// call did the creating.
    ///
    /// `create` runs user constructors, so it must not block lookups of other ids.
    fn get_or_try_create(&self, id: &str, create: Create<'_>) -> Result<(Arc<Session>, bool), InitError>;

    fn remove(&self, id: &str) -> Option<Arc<Session>>;

    fn ids(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops sessions idle for at least `idle` that have nothing queued.
    fn evict_idle(&self, idle: Duration) -> Vec<Arc<Session>> {
        let mut evicted = Vec::new();
        for id in self.ids() {
            let Some(session) = self.get(&id) else {
                continue;
            };
            if session.idle_for() >= idle && session.pending() == 0 {
                if let Some(session) = self.remove(&id) {
                    evicted.push(session);
                }
            }
        }
        evicted
    }
}

/// In-process store backed by a concurrent map.
///
/// Sessions are built outside the map's locks. Builders for the same id take
/// turns on a per-id guard; other ids are never held up.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Arc<Session>>,
    creating: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn get_or_try_create(&self, id: &str, create: Create<'_>) -> Result<(Arc<Session>, bool), InitError> {
        if let Some(session) = self.get(id) {
            return Ok((session, false));
        }

        let guard = self.creating.entry(id.to_string()).or_default().clone();
        let outcome = {
            let _turn = guard.lock().unwrap_or_else(PoisonError::into_inner);
            match self.get(id) {
                Some(session) => Ok((session, false)),
                None => create().map(|session| {
                    let session = Arc::new(session);
                    self.sessions.insert(id.to_string(), session.clone());
                    (session, true)
                }),
            }
        };

        drop(guard);
        self.creating.remove_if(id, |_, guard| Arc::strong_count(guard) == 1);
        outcome
    }

    fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
