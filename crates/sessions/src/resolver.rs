use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use {
    anyhow::Result,
    tokio::sync::Mutex as AsyncMutex,
    tracing::{debug, info, warn},
};

use crate::{
    api::{RemoteSession, SessionApi},
    session::Session,
    store::StateStore,
};

/// Produces the session id a connection should be bound to.
///
/// Resolution order: the in-memory session, a persisted server session, an
/// existing server session (by name, then the first active one), a newly
/// created one. Any failure degrades to a `local-<uuid>` session.
pub struct SessionResolver {
    api: Arc<dyn SessionApi>,
    store: Mutex<StateStore>,
    default_name: String,
    current: AsyncMutex<Option<Session>>,
}

impl SessionResolver {
    pub fn new(api: Arc<dyn SessionApi>, store: StateStore, default_name: impl Into<String>) -> Self {
        Self {
            api,
            store: Mutex::new(store),
            default_name: default_name.into(),
            current: AsyncMutex::new(None),
        }
    }

    /// Convenience constructor using `<data_dir>/state.json`.
    pub fn open(
        api: Arc<dyn SessionApi>,
        data_dir: &Path,
        default_name: impl Into<String>,
    ) -> Result<Self> {
        let store = StateStore::load(data_dir.join("state.json"))?;
        Ok(Self::new(api, store, default_name))
    }

    /// Resolve the active session. Never fails: concurrent callers share one
    /// resolution, and an unreachable server yields a local session.
    pub async fn resolve(&self) -> Session {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return session.clone();
        }

        if let Some(persisted) = self.with_store(|s| s.current_session()) {
            if persisted.is_local() {
                debug!(session_id = %persisted.id, "not reusing persisted local session");
            } else {
                debug!(session_id = %persisted.id, "reusing persisted session");
                *current = Some(persisted.clone());
                return persisted;
            }
        }

        let session = match self.resolve_from_server().await {
            Ok(session) => {
                info!(session_id = %session.id, "session resolved");
                session
            },
            Err(e) => {
                let session = Session::local();
                warn!(error = %e, session_id = %session.id, "session API unavailable, using local session");
                session
            },
        };
        self.persist(&session);
        *current = Some(session.clone());
        session
    }

    /// Re-run server resolution, ignoring the in-memory and persisted
    /// session. On failure the current session is kept.
    pub async fn retry(&self) -> Result<Session> {
        let mut current = self.current.lock().await;
        let session = self.resolve_from_server().await?;
        info!(session_id = %session.id, "session resolved on retry");
        self.persist(&session);
        *current = Some(session.clone());
        Ok(session)
    }

    /// Forget the active session if it is `session_id`, so the next
    /// [`resolve`](Self::resolve) starts over. Returns whether it matched.
    pub async fn invalidate(&self, session_id: &str) -> bool {
        let mut current = self.current.lock().await;
        let in_memory = current.as_ref().is_some_and(|s| s.id == session_id);
        let persisted = self
            .with_store(|s| s.current_session())
            .is_some_and(|s| s.id == session_id);

        if in_memory {
            *current = None;
        }
        if persisted {
            self.clear_persisted();
        }
        if in_memory || persisted {
            info!(session_id, "session invalidated");
        }
        in_memory || persisted
    }

    /// Forget any session, in memory and on disk.
    pub async fn reset(&self) {
        let mut current = self.current.lock().await;
        *current = None;
        self.clear_persisted();
    }

    /// The resolved session, without resolving.
    pub async fn current(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// The persisted session, if any.
    pub fn persisted(&self) -> Option<Session> {
        self.with_store(|s| s.current_session())
    }

    async fn resolve_from_server(&self) -> Result<Session> {
        let sessions = self.api.list().await?;
        if let Some(found) = pick_existing(&sessions, &self.default_name) {
            debug!(session_id = %found.id, name = %found.name, "reusing server session");
            return Ok(Session::server(found.id.clone()));
        }

        let created = self.api.create(&self.default_name).await?;
        info!(session_id = %created.id, name = %self.default_name, "created session");
        Ok(Session::server(created.id))
    }

    fn persist(&self, session: &Session) {
        if let Err(e) = self
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_current_session(session)
        {
            warn!(error = %e, "failed to persist session");
        }
    }

    fn clear_persisted(&self) {
        if let Err(e) = self
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear_current_session()
        {
            warn!(error = %e, "failed to clear persisted session");
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&StateStore) -> T) -> T {
        let guard = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&*guard)
    }
}

/// The session named `default_name`, else the first active one.
fn pick_existing<'a>(sessions: &'a [RemoteSession], default_name: &str) -> Option<&'a RemoteSession> {
    sessions
        .iter()
        .find(|s| s.is_active && s.name == default_name)
        .or_else(|| sessions.iter().find(|s| s.is_active))
}
