//! Session controller
//! Thin in-memory layer over the conversation store: named sessions, a
//! single active one, snapshot-on-mutation, titles from the first user turn.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::modules::conversation::{ConversationStore, Message, Role};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    #[default]
    Chat,
    Canvas,
    DeepResearch,
    Image,
    Video,
}

pub const DEFAULT_TITLE: &str = "New chat";
const TITLE_MAX_CHARS: usize = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub timestamp: i64,
    pub mode: AppMode,
    pub is_thinking: bool,
    pub canvas: String,
}

#[derive(Default)]
struct Inner {
    sessions: Vec<ChatSession>,
    active: Option<String>,
}

#[derive(Default)]
pub struct SessionController {
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the active session, then create and activate an empty one.
    pub fn create(&self, store: &ConversationStore) -> ChatSession {
        let mut inner = self.inner.lock().expect("session controller poisoned");
        snapshot_active(&mut inner, store);

        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            mode: AppMode::Chat,
            is_thinking: false,
            canvas: String::new(),
        };
        inner.active = Some(session.id.clone());
        inner.sessions.push(session.clone());
        store.replace_all(Vec::new());
        session
    }

    /// Id of the active session, creating one when none exists yet.
    pub fn ensure_active(&self, store: &ConversationStore) -> String {
        {
            let inner = self.inner.lock().expect("session controller poisoned");
            if let Some(id) = &inner.active {
                return id.clone();
            }
        }
        self.create(store).id
    }

    /// Snapshot the active session and swap in the target's messages.
    /// Returns false when the id is unknown.
    pub fn switch(&self, id: &str, store: &ConversationStore) -> bool {
        let mut inner = self.inner.lock().expect("session controller poisoned");
        if !inner.sessions.iter().any(|s| s.id == id) {
            return false;
        }
        snapshot_active(&mut inner, store);

        let target = inner
            .sessions
            .iter()
            .find(|s| s.id == id)
            .expect("presence checked above");
        store.replace_all(target.messages.clone());
        inner.active = Some(id.to_string());
        true
    }

    /// Copy the live message list into the active session and refresh its
    /// title and timestamp.
    pub fn snapshot(&self, store: &ConversationStore) {
        let mut inner = self.inner.lock().expect("session controller poisoned");
        snapshot_active(&mut inner, store);
    }

    /// Sessions ordered by recency, most recent first.
    pub fn list(&self) -> Vec<ChatSession> {
        let inner = self.inner.lock().expect("session controller poisoned");
        let mut sessions = inner.sessions.clone();
        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        sessions
    }

    pub fn active_id(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("session controller poisoned")
            .active
            .clone()
    }

    pub fn set_mode(&self, mode: AppMode) {
        self.with_active(|s| s.mode = mode);
    }

    pub fn set_thinking(&self, thinking: bool) {
        self.with_active(|s| s.is_thinking = thinking);
    }

    pub fn canvas(&self) -> String {
        let inner = self.inner.lock().expect("session controller poisoned");
        active_session(&inner)
            .map(|s| s.canvas.clone())
            .unwrap_or_default()
    }

    pub fn set_canvas(&self, content: String) {
        self.with_active(|s| s.canvas = content);
    }

    fn with_active(&self, f: impl FnOnce(&mut ChatSession)) {
        let mut inner = self.inner.lock().expect("session controller poisoned");
        let Some(id) = inner.active.clone() else {
            return;
        };
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) {
            f(session);
        }
    }
}

fn active_session<'a>(inner: &'a Inner) -> Option<&'a ChatSession> {
    let id = inner.active.as_deref()?;
    inner.sessions.iter().find(|s| s.id == id)
}

fn snapshot_active(inner: &mut Inner, store: &ConversationStore) {
    let Some(id) = inner.active.clone() else {
        return;
    };
    let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) else {
        return;
    };
    session.messages = store.messages();
    session.timestamp = chrono::Utc::now().timestamp_millis();
    if session.title == DEFAULT_TITLE {
        if let Some(first_user) = session.messages.iter().find(|m| m.role == Role::User) {
            session.title = derive_title(&first_user.content);
        }
    }
}

/// First 30 characters of the first user turn, with an ellipsis when cut.
fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}
