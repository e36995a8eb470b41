// Veera Core Engine — Session Store
// Holds the ordered session list in memory and persists it as one JSON
// blob (an array of ChatSession records) under a fixed storage key.
// Persistence is explicit: nothing is written until `save_all`, and the
// turn driver saves at turn boundaries rather than per streamed event.
//
// The storage mechanism behind the blob is a trait so embedders can swap
// the file backend for whatever key-value store hosts them.

use crate::atoms::constants::{SESSIONS_STORAGE_KEY, STORE_DIR_NAME, STREAM_FAILURE_NOTICE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::{ChatSession, Message};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

// ── Blob backends ──────────────────────────────────────────────────────────

/// Minimal key → string persistence seam for the session blob.
pub trait BlobStore: Send + Sync {
    /// Read the blob, `None` when nothing was ever stored.
    fn read(&self, key: &str) -> EngineResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> EngineResult<()>;
}

/// Default backend: one `<key>.json` file per key under `~/.veera`.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        FileBlobStore { dir: home.join(STORE_DIR_NAME) }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        FileBlobStore { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Default for FileBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: &str) -> EngineResult<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> EngineResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }
}

/// In-memory backend for tests and embedders without a filesystem.
/// Clones share the same map, so a test can hold one clone to inspect
/// what the store persisted.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> EngineResult<()> {
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ── Session store ──────────────────────────────────────────────────────────

pub struct SessionStore {
    sessions: Mutex<Vec<ChatSession>>,
    backend: Box<dyn BlobStore>,
}

impl SessionStore {
    /// Store over an explicit backend, starting empty. Call `load` to pull
    /// in persisted sessions.
    pub fn new(backend: Box<dyn BlobStore>) -> Self {
        SessionStore { sessions: Mutex::new(Vec::new()), backend }
    }

    /// Store over the default file backend, with persisted sessions loaded.
    pub fn open() -> Self {
        let store = Self::new(Box::new(FileBlobStore::new()));
        store.load();
        store
    }

    // ── Persistence lifecycle ──────────────────────────────────────────

    /// Load the persisted session list. A missing blob means a fresh
    /// install; a corrupt blob is logged and discarded — never fatal.
    ///
    /// A message still flagged in-progress was orphaned by a shutdown
    /// mid-turn. No driver can be writing it any more, so it is settled
    /// here as failed: flag cleared, failure notice appended. Left alone
    /// it would block the session forever (the admission check would see
    /// a turn that can never finish).
    pub fn load(&self) {
        let mut loaded: Vec<ChatSession> = match self.backend.read(SESSIONS_STORAGE_KEY) {
            Ok(Some(blob)) => match serde_json::from_str(&blob) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("[sessions] Stored session data is corrupt, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[sessions] Could not read stored sessions, starting empty: {}", e);
                Vec::new()
            }
        };
        for session in &mut loaded {
            for message in &mut session.messages {
                if message.is_streaming {
                    warn!(
                        "[sessions] Message {} in session {} was mid-stream at shutdown, settling as failed",
                        message.id, session.id
                    );
                    message.is_streaming = false;
                    message.set_text(format!("{}{}", message.text(), STREAM_FAILURE_NOTICE));
                }
            }
        }
        info!("[sessions] Loaded {} session(s)", loaded.len());
        *self.sessions.lock() = loaded;
    }

    /// Serialize the whole session list and write it under the fixed key.
    pub fn save_all(&self) -> EngineResult<()> {
        let blob = {
            let sessions = self.sessions.lock();
            serde_json::to_string(&*sessions)?
        };
        self.backend.write(SESSIONS_STORAGE_KEY, &blob)
    }

    // ── Session CRUD ───────────────────────────────────────────────────

    /// Create a session with the default title and prepend it (newest
    /// first, matching the sidebar order).
    pub fn create_session(&self, model: &str) -> ChatSession {
        let session = ChatSession::new(model);
        self.sessions.lock().insert(0, session.clone());
        info!("[sessions] Created session {}", session.id);
        session
    }

    pub fn list_all(&self) -> Vec<ChatSession> {
        self.sessions.lock().clone()
    }

    pub fn get_session(&self, id: &str) -> Option<ChatSession> {
        self.sessions.lock().iter().find(|s| s.id == id).cloned()
    }

    /// Remove a session entirely. Returns false when no such session.
    pub fn remove_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        let removed = sessions.len() < before;
        if removed {
            info!("[sessions] Removed session {}", id);
        }
        removed
    }

    /// Retitle a session. No-op (logged) when the session is gone.
    pub fn set_title(&self, session_id: &str, title: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.iter_mut().find(|s| s.id == session_id) {
            Some(s) => {
                s.title = title.to_string();
                true
            }
            None => {
                warn!("[sessions] set_title: session {} not found", session_id);
                false
            }
        }
    }

    // ── Message operations ─────────────────────────────────────────────

    /// Admit a turn: verify no message in the session is mid-stream,
    /// title an empty session, and append the user message plus the
    /// placeholder, all under one lock. Two racing starts cannot both
    /// pass the check. Returns the message history as it stood before
    /// the appends; a refused call leaves the session untouched.
    pub fn begin_turn(
        &self,
        session_id: &str,
        title: &str,
        user: Message,
        placeholder: Message,
    ) -> EngineResult<Vec<Message>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| EngineError::store(format!("no session {session_id}")))?;
        if session.messages.iter().any(|m| m.is_streaming) {
            return Err(EngineError::Other(format!(
                "session {session_id} already has a turn in progress"
            )));
        }
        let history = session.messages.clone();
        if session.messages.is_empty() {
            session.title = title.to_string();
        }
        session.messages.push(user);
        session.messages.push(placeholder);
        Ok(history)
    }

    /// Append a message to a session.
    pub fn append_message(&self, session_id: &str, message: Message) -> EngineResult<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| EngineError::store(format!("no session {session_id}")))?;
        session.messages.push(message);
        Ok(())
    }

    /// Mutate a message in place. Returns false — a logged no-op — when
    /// the session or message is gone, so a turn finishing against a
    /// deleted session cannot corrupt anything else.
    pub fn update_message(
        &self,
        session_id: &str,
        message_id: &str,
        mutate: impl FnOnce(&mut Message),
    ) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
            warn!("[sessions] update_message: session {} not found", session_id);
            return false;
        };
        let Some(message) = session.messages.iter_mut().find(|m| m.id == message_id) else {
            warn!(
                "[sessions] update_message: message {} not found in session {}",
                message_id, session_id
            );
            return false;
        };
        mutate(message);
        true
    }

    /// Whether the session currently has an in-progress model message.
    pub fn has_streaming_message(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.messages.iter().any(|m| m.is_streaming))
            .unwrap_or(false)
    }
}
