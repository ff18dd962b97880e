//! Session registry: the collector's directory of node id → session.
//!
//! One lock guards the whole map so the existence check and the insert in
//! [`SessionRegistry::new_session`] happen together. Entries are never
//! evicted; a disconnected node stays listed until the process exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

use fleetbeat_core::identity::UNASSIGNED;

#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<u32, Arc<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, id: u32) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<S>> {
        self.lock().get(&id).cloned()
    }

    /// Insert or overwrite. Last writer wins; the displaced session, if any,
    /// is returned.
    pub fn add(&self, id: u32, session: Arc<S>) -> Option<Arc<S>> {
        self.lock().insert(id, session)
    }

    /// Allocate an unused non-zero id, build the session for it with `make`
    /// and insert it, all under one lock acquisition.
    pub fn new_session(&self, make: impl FnOnce(u32) -> S) -> Arc<S> {
        let mut sessions = self.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if candidate != UNASSIGNED && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(make(id));
        sessions.insert(id, session.clone());
        session
    }

    /// Return the session under `id` if `reuse` accepts it; otherwise build
    /// one with `make` and insert it in its place. The lookup, the `reuse`
    /// check and the insert happen under one lock acquisition. The flag is
    /// true when a new session was inserted.
    pub fn get_or_insert_with(
        &self,
        id: u32,
        reuse: impl FnOnce(&S) -> bool,
        make: impl FnOnce() -> S,
    ) -> (Arc<S>, bool) {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(&id) {
            if reuse(existing) {
                return (existing.clone(), false);
            }
        }
        let session = Arc::new(make());
        sessions.insert(id, session.clone());
        (session, true)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every session, ordered by id.
    pub fn snapshot(&self) -> Vec<(u32, Arc<S>)> {
        let mut all: Vec<(u32, Arc<S>)> =
            self.lock().iter().map(|(id, s)| (*id, s.clone())).collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<S>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
