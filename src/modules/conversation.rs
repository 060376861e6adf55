//! Conversation state store
//! Sole owner of the ordered message list; every other component holds
//! message ids and goes through `append`/`patch`.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::providers::GroundingUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    DeepResearch,
    Error,
}

/// Lifecycle of a deep-research message. Transitions only move forward:
/// planning -> proposed -> in_progress -> completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchState {
    Planning,
    Proposed,
    InProgress,
    Completed,
}

impl ResearchState {
    /// Whether `next` is a legal transition target. Re-asserting the current
    /// state is allowed so patches stay idempotent.
    pub fn can_transition_to(self, next: ResearchState) -> bool {
        use ResearchState::*;
        matches!(
            (self, next),
            (Planning, Planning)
                | (Planning, Proposed)
                | (Proposed, Proposed)
                | (Proposed, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (Completed, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

/// User-supplied file carried on a message, base64-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub data: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_steps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_state: Option<ResearchState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_research_step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding_urls: Option<Vec<GroundingUrl>>,
    pub timestamp: i64,
}

/// Fields for `append`; id and timestamp are assigned by the store
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub role: Option<Role>,
    pub content: String,
    pub kind: Option<MessageKind>,
    pub attachments: Vec<Attachment>,
    pub research_steps: Option<Vec<String>>,
    pub research_state: Option<ResearchState>,
}

/// Partial update merged into an existing message. `None` fields are left
/// untouched, including streaming accumulators.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub kind: Option<MessageKind>,
    pub images: Option<Vec<String>>,
    pub video_uri: Option<String>,
    pub research_steps: Option<Vec<String>>,
    pub research_state: Option<ResearchState>,
    pub active_research_step: Option<usize>,
    pub grounding_urls: Option<Vec<GroundingUrl>>,
}

/// Append-only message list for the active session. Patches never reorder
/// or remove; last write wins per field.
#[derive(Default)]
pub struct ConversationStore {
    messages: Mutex<Vec<Message>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, new: NewMessage) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let message = Message {
            id: id.clone(),
            role: new.role.unwrap_or(Role::Assistant),
            content: new.content,
            kind: new.kind.unwrap_or(MessageKind::Text),
            attachments: new.attachments,
            images: None,
            video_uri: None,
            research_steps: new.research_steps,
            research_state: new.research_state,
            active_research_step: None,
            grounding_urls: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.messages
            .lock()
            .expect("conversation store poisoned")
            .push(message);
        id
    }

    /// Merge `patch` into the message with the given id. Returns false when
    /// the id is unknown, or when the patch asks for a backward research
    /// state transition; in both cases nothing is merged.
    pub fn patch(&self, id: &str, patch: MessagePatch) -> bool {
        let mut messages = self.messages.lock().expect("conversation store poisoned");
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };

        if let (Some(current), Some(next)) = (message.research_state, patch.research_state) {
            if !current.can_transition_to(next) {
                warn!("rejecting research state change {current:?} -> {next:?}");
                return false;
            }
        }

        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(kind) = patch.kind {
            message.kind = kind;
        }
        if let Some(images) = patch.images {
            message.images = Some(images);
        }
        if let Some(video_uri) = patch.video_uri {
            message.video_uri = Some(video_uri);
        }
        if let Some(steps) = patch.research_steps {
            message.research_steps = Some(steps);
        }
        if let Some(state) = patch.research_state {
            message.research_state = Some(state);
        }
        if let Some(step) = patch.active_research_step {
            message.active_research_step = Some(step);
        }
        if let Some(urls) = patch.grounding_urls {
            message.grounding_urls = Some(urls);
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.messages
            .lock()
            .expect("conversation store poisoned")
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Message immediately preceding the given id, if any.
    pub fn preceding(&self, id: &str) -> Option<Message> {
        let messages = self.messages.lock().expect("conversation store poisoned");
        let index = messages.iter().position(|m| m.id == id)?;
        index.checked_sub(1).map(|prev| messages[prev].clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .expect("conversation store poisoned")
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.messages
            .lock()
            .expect("conversation store poisoned")
            .is_empty()
    }

    /// Swap in a different session's message list.
    pub fn replace_all(&self, messages: Vec<Message>) {
        *self.messages.lock().expect("conversation store poisoned") = messages;
    }
}
