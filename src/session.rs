//! Process-lifetime conversation storage keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::message::Message;

type SessionLog = Arc<Mutex<Vec<Message>>>;

/// Per-session, append-only message logs.
///
/// The outer map lock is only held while looking up or inserting a session;
/// each session carries its own mutex, so different sessions never contend
/// and appends to one session are serialized.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionLog>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the session's messages, creating the session on
    /// first use.
    pub async fn get_or_create(&self, session_id: &str) -> Vec<Message> {
        let log = self.log(session_id).await;
        let messages = log.lock().await;
        messages.clone()
    }

    pub async fn append(&self, session_id: &str, message: Message) {
        let log = self.log(session_id).await;
        log.lock().await.push(message);
    }

    /// Takes the session's lease. While the guard lives no other caller can
    /// read or append to this session.
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let log = self.log(session_id).await;
        SessionGuard {
            session_id: session_id.to_string(),
            messages: log.lock_owned().await,
        }
    }

    pub async fn len(&self, session_id: &str) -> usize {
        let log = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match log {
            Some(log) => log.lock().await.len(),
            None => 0,
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids = self
            .sessions
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Drops a whole session. Messages are never edited individually.
    ///
    /// Only call this for a session nobody holds a [`SessionGuard`] on, such
    /// as a nested run's scratch session once that run has returned. A guard
    /// outliving the removal keeps the detached log, and a later
    /// [`lock`](Self::lock) on the same id gets a fresh one that is not
    /// serialized against it.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    async fn log(&self, session_id: &str) -> SessionLog {
        if let Some(log) = self.sessions.read().await.get(session_id) {
            return log.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }
}

/// Exclusive access to one session for the duration of an agent run.
pub struct SessionGuard {
    session_id: String,
    messages: OwnedMutexGuard<Vec<Message>>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session_id", &self.session_id)
            .field("len", &self.messages.len())
            .finish()
    }
}
