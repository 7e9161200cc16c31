//! In-memory session registry in front of [`SessionStorage`].
//!
//! Each session has its own slot. Mutations go through an [`EditLease`]
//! taken by compare-and-swap on the slot's edit flag, so a second edit
//! fails fast instead of queueing. The slot mutex only guards the value
//! swap and never spans an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use atelier_contracts::errors::{EngineError, EngineResult};
use atelier_contracts::sessions::{Session, SessionSummary};
use tracing::debug;

use crate::storage::SessionStorage;

struct SessionSlot {
    session: Mutex<Session>,
    editing: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(session),
            editing: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| poisoned())
    }
}

pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Persists a brand new session and makes it addressable.
    pub fn insert(&self, session: Session) -> EngineResult<Session> {
        self.storage.save(&session)?;
        let mut slots = self.slots.lock().map_err(|_| poisoned())?;
        slots.insert(session.session_id.clone(), SessionSlot::new(session.clone()));
        Ok(session)
    }

    /// Cached slot, or a freshly loaded one. Storage is read without holding
    /// the map lock; a concurrent loader that wins the insert is kept.
    fn slot(&self, session_id: &str) -> EngineResult<Arc<SessionSlot>> {
        {
            let slots = self.slots.lock().map_err(|_| poisoned())?;
            if let Some(slot) = slots.get(session_id) {
                return Ok(Arc::clone(slot));
            }
        }
        let session = self
            .storage
            .load(session_id)?
            .ok_or_else(|| EngineError::not_found(format!("session {session_id}")))?;
        let mut slots = self.slots.lock().map_err(|_| poisoned())?;
        let slot = slots
            .entry(session_id.to_string())
            .or_insert_with(|| SessionSlot::new(session));
        Ok(Arc::clone(slot))
    }

    pub fn snapshot(&self, session_id: &str) -> EngineResult<Session> {
        let slot = self.slot(session_id)?;
        let session = slot.lock()?;
        Ok(session.clone())
    }

    pub fn begin_edit(&self, session_id: &str) -> EngineResult<EditLease> {
        let slot = self.slot(session_id)?;
        if slot
            .editing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(session_id, "edit lease contended");
            return Err(EngineError::ConcurrentModificationConflict {
                session_id: session_id.to_string(),
            });
        }
        Ok(EditLease {
            session_id: session_id.to_string(),
            slot,
            storage: Arc::clone(&self.storage),
        })
    }

    /// Lease, apply `transition`, persist, release.
    pub fn mutate<F>(&self, session_id: &str, transition: F) -> EngineResult<Session>
    where
        F: FnOnce(&Session) -> EngineResult<Session>,
    {
        self.begin_edit(session_id)?.commit(transition)
    }

    /// Summaries of every stored session, most recently updated first.
    pub fn list(&self, project_id: Option<&str>) -> EngineResult<Vec<SessionSummary>> {
        let mut sessions: HashMap<String, Session> = self
            .storage
            .list()?
            .into_iter()
            .map(|session| (session.session_id.clone(), session))
            .collect();
        let slots: Vec<Arc<SessionSlot>> = {
            let slots = self.slots.lock().map_err(|_| poisoned())?;
            slots.values().cloned().collect()
        };
        for slot in slots {
            let session = slot.lock()?.clone();
            sessions.insert(session.session_id.clone(), session);
        }

        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|session| project_id.map_or(true, |project| session.project_id == project))
            .map(Session::summary)
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(summaries)
    }

    /// Removes a session from memory and storage. Refused while an edit is in flight.
    pub fn delete(&self, session_id: &str) -> EngineResult<()> {
        let lease = self.begin_edit(session_id)?;
        self.storage.delete(session_id)?;
        let mut slots = self.slots.lock().map_err(|_| poisoned())?;
        slots.remove(session_id);
        drop(lease);
        Ok(())
    }
}

/// Exclusive right to mutate one session. Released on drop.
pub struct EditLease {
    session_id: String,
    slot: Arc<SessionSlot>,
    storage: Arc<dyn SessionStorage>,
}

impl EditLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> EngineResult<Session> {
        Ok(self.slot.lock()?.clone())
    }

    /// Computes the next value from the current one and persists it before
    /// it becomes visible. A failed transition or save leaves the old value.
    pub fn commit<F>(&self, transition: F) -> EngineResult<Session>
    where
        F: FnOnce(&Session) -> EngineResult<Session>,
    {
        let mut current = self.slot.lock()?;
        let next = transition(&current)?;
        self.storage.save(&next)?;
        *current = next.clone();
        Ok(next)
    }
}

impl Drop for EditLease {
    fn drop(&mut self) {
        self.slot.editing.store(false, Ordering::Release);
    }
}

fn poisoned() -> EngineError {
    EngineError::Storage(anyhow::anyhow!("session lock poisoned"))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use atelier_contracts::errors::EngineError;
    use atelier_contracts::sessions::Session;

    use super::SessionStore;
    use crate::branch;
    use crate::storage::SessionStorage;
    use crate::testing::MemoryStorage;

    /// Storage whose loads announce themselves and then wait for a release.
    struct GatedStorage {
        inner: MemoryStorage,
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl SessionStorage for GatedStorage {
        fn load(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
            self.entered
                .lock()
                .map_err(|_| anyhow::anyhow!("gate poisoned"))?
                .send(())?;
            self.release
                .lock()
                .map_err(|_| anyhow::anyhow!("gate poisoned"))?
                .recv()?;
            self.inner.load(session_id)
        }

        fn save(&self, session: &Session) -> anyhow::Result<()> {
            self.inner.save(session)
        }

        fn delete(&self, session_id: &str) -> anyhow::Result<bool> {
            self.inner.delete(session_id)
        }

        fn list(&self) -> anyhow::Result<Vec<Session>> {
            self.inner.list()
        }
    }

    fn store_with(storage: Arc<MemoryStorage>) -> SessionStore {
        SessionStore::new(storage)
    }

    #[test]
    fn second_lease_fails_fast_until_first_is_dropped() -> anyhow::Result<()> {
        let store = store_with(Arc::new(MemoryStorage::default()));
        let session = store.insert(Session::new("default", "m"))?;

        let lease = store.begin_edit(&session.session_id)?;
        let conflict = store.begin_edit(&session.session_id);
        assert!(matches!(
            conflict,
            Err(EngineError::ConcurrentModificationConflict { .. })
        ));
        assert!(store.snapshot(&session.session_id).is_ok());

        drop(lease);
        assert!(store.begin_edit(&session.session_id).is_ok());
        Ok(())
    }

    #[test]
    fn commit_persists_before_publishing() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::default());
        let store = store_with(Arc::clone(&storage));
        let session = store.insert(Session::new("default", "m"))?;

        let next = store.mutate(&session.session_id, |s| branch::append_user_turn(s, "a fox"))?;
        let stored = storage.load(&session.session_id)?;
        assert_eq!(stored.as_ref(), Some(&next));

        storage.fail_saves(true);
        let failed = store.mutate(&session.session_id, branch::undo);
        assert!(matches!(failed, Err(EngineError::Storage(_))));
        assert_eq!(store.snapshot(&session.session_id)?, next);
        Ok(())
    }

    #[test]
    fn failed_transition_keeps_value_and_releases_lease() -> anyhow::Result<()> {
        let store = store_with(Arc::new(MemoryStorage::default()));
        let session = store.insert(Session::new("default", "m"))?;
        let result = store.mutate(&session.session_id, branch::undo);
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
        assert_eq!(store.snapshot(&session.session_id)?, session);
        assert!(store.begin_edit(&session.session_id).is_ok());
        Ok(())
    }

    #[test]
    fn sessions_load_lazily_from_storage() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::default());
        let session = Session::new("default", "m");
        storage.save(&session)?;

        let store = store_with(Arc::clone(&storage));
        assert_eq!(store.snapshot(&session.session_id)?, session);
        assert!(matches!(
            store.snapshot("missing"),
            Err(EngineError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn slow_load_does_not_block_cached_sessions() -> anyhow::Result<()> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let storage = Arc::new(GatedStorage {
            inner: MemoryStorage::default(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let cold = Session::new("default", "m");
        storage.inner.save(&cold)?;
        let store = SessionStore::new(storage);
        let warm = store.insert(Session::new("default", "m"))?;

        thread::scope(|scope| -> anyhow::Result<()> {
            let loading = scope.spawn(|| store.snapshot(&cold.session_id));
            entered_rx.recv_timeout(Duration::from_secs(5))?;

            let (done_tx, done_rx) = mpsc::channel();
            let (store, warm_id) = (&store, &warm.session_id);
            scope.spawn(move || {
                let _ = done_tx.send(store.snapshot(warm_id));
            });
            let read = done_rx.recv_timeout(Duration::from_secs(5));
            release_tx.send(())?;

            assert_eq!(read??, warm);
            let loaded = loading
                .join()
                .map_err(|_| anyhow::anyhow!("loader panicked"))??;
            assert_eq!(loaded, cold);
            Ok(())
        })
    }

    #[test]
    fn list_orders_by_recency_and_delete_respects_leases() -> anyhow::Result<()> {
        let store = store_with(Arc::new(MemoryStorage::default()));
        let older = store.insert(Session::new("default", "m"))?;
        let newer = store.insert(Session::new("default", "m"))?;
        let other_project = store.insert(Session::new("p2", "m"))?;
        store.mutate(&newer.session_id, |s| branch::append_user_turn(s, "x"))?;

        let listed: Vec<String> = store
            .list(Some("default"))?
            .into_iter()
            .map(|summary| summary.session_id)
            .collect();
        assert_eq!(listed[0], newer.session_id);
        assert!(listed.contains(&older.session_id));
        assert!(!listed.contains(&other_project.session_id));

        let lease = store.begin_edit(&older.session_id)?;
        assert!(matches!(
            store.delete(&older.session_id),
            Err(EngineError::ConcurrentModificationConflict { .. })
        ));
        drop(lease);
        store.delete(&older.session_id)?;
        assert!(matches!(
            store.snapshot(&older.session_id),
            Err(EngineError::NotFound(_))
        ));
        Ok(())
    }
}
