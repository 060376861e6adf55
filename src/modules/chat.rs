//! Flow dispatch
//! One entry point per user action: submit (mode-dispatched), start-research
//! (plan confirmation) and stop. Owns the generation-in-progress flag and the
//! cancellation token behind it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::modules::conversation::{
    Attachment, ConversationStore, MessageKind, MessagePatch, NewMessage, ResearchState, Role,
};
use crate::modules::deep_research::{DeepResearchService, ResearchError};
use crate::modules::research_plan::ResearchPlanner;
use crate::modules::session::{AppMode, SessionController};
use crate::providers::{
    ConversationTurn, GenerateOptions, GenerationBackend, GenerationError, InlinePart, TurnRole,
    DEFAULT_FLASH_MODEL, DEFAULT_PRO_MODEL,
};

const THINKING_BUDGET: u32 = 16384;

const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Polling gives up after 120 attempts (ten minutes at the 5 s interval).
const VIDEO_POLL_LIMIT: u32 = 120;

const CHAT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful, precise assistant. Answer in the user's language and \
     format responses in markdown.";

const CANVAS_SYSTEM_INSTRUCTION: &str =
    "You are collaborating on a shared document. Respond with the full updated \
     document content in markdown, not commentary about it.";

/// Events emitted while a flow runs, serialized onto the SSE channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FlowEvent {
    Delta { message_id: String, text: String },
    PlanProposed { message_id: String, steps: Vec<String> },
    ResearchStep { message_id: String, step: usize },
    Completed { message_id: String },
    Error { message_id: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("a generation is already in progress")]
    Busy,
    #[error("message not found")]
    UnknownMessage,
    #[error("research is not awaiting confirmation")]
    NotProposed,
    #[error("video generation timed out")]
    VideoTimeout,
    #[error("generation was stopped")]
    Cancelled,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<ResearchError> for FlowError {
    fn from(err: ResearchError) -> Self {
        match err {
            ResearchError::Cancelled => FlowError::Cancelled,
            ResearchError::Generation(e) => FlowError::Generation(e),
        }
    }
}

/// Single-flight guard: one live cancellation token at a time.
#[derive(Default)]
struct GenerationGuard {
    token: Mutex<Option<CancellationToken>>,
}

impl GenerationGuard {
    fn begin(&self) -> Result<CancellationToken, FlowError> {
        let mut slot = self.token.lock().expect("generation guard poisoned");
        if slot.is_some() {
            return Err(FlowError::Busy);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok(token)
    }

    fn finish(&self) {
        *self.token.lock().expect("generation guard poisoned") = None;
    }

    fn stop(&self) {
        if let Some(token) = self.token.lock().expect("generation guard poisoned").as_ref() {
            token.cancel();
        }
    }

    fn is_generating(&self) -> bool {
        self.token
            .lock()
            .expect("generation guard poisoned")
            .is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub content: String,
    pub mode: AppMode,
    pub thinking: bool,
    pub attachments: Vec<Attachment>,
}

pub struct ChatService {
    backend: Arc<dyn GenerationBackend>,
    store: Arc<ConversationStore>,
    sessions: Arc<SessionController>,
    planner: ResearchPlanner,
    research: DeepResearchService,
    guard: GenerationGuard,
    video_poll_interval: Duration,
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        store: Arc<ConversationStore>,
        sessions: Arc<SessionController>,
    ) -> Self {
        Self {
            planner: ResearchPlanner::new(backend.clone()),
            research: DeepResearchService::new(backend.clone()),
            backend,
            store,
            sessions,
            guard: GenerationGuard::default(),
            video_poll_interval: VIDEO_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_video_poll_interval(mut self, interval: Duration) -> Self {
        self.video_poll_interval = interval;
        self
    }

    /// Cancel the live generation, if any. A no-op otherwise.
    pub fn stop(&self) {
        self.guard.stop();
    }

    pub fn is_generating(&self) -> bool {
        self.guard.is_generating()
    }

    /// Handle a user submission: append the user message, then run the flow
    /// the current mode selects. Rejected with `Busy` while another
    /// generation is live.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        mut emit: impl FnMut(FlowEvent) + Send,
    ) -> Result<(), FlowError> {
        let token = self.guard.begin()?;
        self.sessions.ensure_active(&self.store);
        self.sessions.set_mode(request.mode);
        self.sessions.set_thinking(request.thinking);

        self.store.append(NewMessage {
            role: Some(Role::User),
            content: request.content.clone(),
            attachments: request.attachments.clone(),
            ..Default::default()
        });

        let result = match request.mode {
            AppMode::Chat | AppMode::Canvas => {
                self.run_chat(&request, &token, &mut emit).await
            }
            AppMode::DeepResearch => {
                self.run_plan(&request.content, &token, &mut emit).await
            }
            AppMode::Image => self.run_image(&request.content, &token, &mut emit).await,
            AppMode::Video => self.run_video(&request.content, &token, &mut emit).await,
        };

        self.conclude(result, &mut emit);
        Ok(())
    }

    /// Confirm a proposed research plan and run it. `steps` is the plan as
    /// the user last saw it, edits included; it is re-frozen on the message
    /// before execution starts.
    pub async fn start_research(
        &self,
        message_id: &str,
        steps: Vec<String>,
        mut emit: impl FnMut(FlowEvent) + Send,
    ) -> Result<(), FlowError> {
        let token = self.guard.begin()?;
        let result = self
            .run_research(message_id, steps, &token, &mut emit)
            .await;
        self.conclude(result, &mut emit);
        Ok(())
    }

    /// Common flow epilogue: snapshot the session, release the guard, and
    /// surface fatal errors as a fresh error-kind message. Cancellation is
    /// silent.
    fn conclude(&self, result: Result<(), FlowError>, emit: &mut impl FnMut(FlowEvent)) {
        self.sessions.snapshot(&self.store);
        self.guard.finish();

        match result {
            Ok(()) | Err(FlowError::Cancelled) => {}
            Err(err) => {
                warn!("flow failed: {err}");
                let id = self.store.append(NewMessage {
                    kind: Some(MessageKind::Error),
                    content: err.to_string(),
                    ..Default::default()
                });
                emit(FlowEvent::Error {
                    message_id: id,
                    message: err.to_string(),
                });
            }
        }
    }

    async fn run_chat(
        &self,
        request: &SubmitRequest,
        cancel: &CancellationToken,
        emit: &mut (impl FnMut(FlowEvent) + Send),
    ) -> Result<(), FlowError> {
        let turns = self.history_turns();
        let options = self.chat_options(request.mode, request.thinking);
        let canvas_mode = request.mode == AppMode::Canvas;

        let message_id = self.store.append(NewMessage::default());
        let mut stream = self.backend.stream_chat(&turns, &options).await?;

        let mut content = String::new();
        let mut urls = Vec::new();
        while let Some(delta) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let delta = delta.map_err(FlowError::Generation)?;
            urls.extend(delta.grounding_urls);
            if delta.text.is_empty() {
                continue;
            }
            content.push_str(&delta.text);
            self.store.patch(
                &message_id,
                MessagePatch {
                    content: Some(content.clone()),
                    ..Default::default()
                },
            );
            if canvas_mode {
                self.sessions.set_canvas(content.clone());
            }
            emit(FlowEvent::Delta {
                message_id: message_id.clone(),
                text: delta.text,
            });
        }

        if !urls.is_empty() {
            self.store.patch(
                &message_id,
                MessagePatch {
                    grounding_urls: Some(urls),
                    ..Default::default()
                },
            );
        }
        emit(FlowEvent::Completed {
            message_id: message_id.clone(),
        });
        Ok(())
    }

    async fn run_plan(
        &self,
        query: &str,
        cancel: &CancellationToken,
        emit: &mut (impl FnMut(FlowEvent) + Send),
    ) -> Result<(), FlowError> {
        let message_id = self.store.append(NewMessage {
            kind: Some(MessageKind::DeepResearch),
            research_state: Some(ResearchState::Planning),
            ..Default::default()
        });

        let steps = self.planner.create_plan(query).await;
        // a stop while the plan request was in flight discards the plan
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        self.store.patch(
            &message_id,
            MessagePatch {
                research_steps: Some(steps.clone()),
                research_state: Some(ResearchState::Proposed),
                ..Default::default()
            },
        );
        emit(FlowEvent::PlanProposed { message_id, steps });
        Ok(())
    }

    async fn run_research(
        &self,
        message_id: &str,
        steps: Vec<String>,
        cancel: &CancellationToken,
        emit: &mut (impl FnMut(FlowEvent) + Send),
    ) -> Result<(), FlowError> {
        let message = self
            .store
            .get(message_id)
            .ok_or(FlowError::UnknownMessage)?;
        if message.kind != MessageKind::DeepResearch
            || message.research_state != Some(ResearchState::Proposed)
        {
            return Err(FlowError::NotProposed);
        }

        // the research query is the user turn the proposal answered
        let query = self
            .store
            .preceding(message_id)
            .filter(|m| m.role == Role::User)
            .map(|m| m.content)
            .unwrap_or_default();

        self.store.patch(
            message_id,
            MessagePatch {
                research_steps: Some(steps.clone()),
                research_state: Some(ResearchState::InProgress),
                active_research_step: Some(0),
                ..Default::default()
            },
        );
        info!("research confirmed, executing {} plan entries", steps.len());

        let emit = Mutex::new(emit);
        let mut content = String::new();
        let outcome = self
            .research
            .execute(
                &query,
                &steps,
                cancel,
                |phase| {
                    self.store.patch(
                        message_id,
                        MessagePatch {
                            active_research_step: Some(phase),
                            ..Default::default()
                        },
                    );
                    (emit.lock().expect("emit poisoned"))(FlowEvent::ResearchStep {
                        message_id: message_id.to_string(),
                        step: phase,
                    });
                },
                |chunk| {
                    content.push_str(chunk);
                    self.store.patch(
                        message_id,
                        MessagePatch {
                            content: Some(content.clone()),
                            ..Default::default()
                        },
                    );
                    (emit.lock().expect("emit poisoned"))(FlowEvent::Delta {
                        message_id: message_id.to_string(),
                        text: chunk.to_string(),
                    });
                },
            )
            .await?;

        self.store.patch(
            message_id,
            MessagePatch {
                research_state: Some(ResearchState::Completed),
                grounding_urls: Some(outcome.grounding_urls),
                ..Default::default()
            },
        );
        (emit.lock().expect("emit poisoned"))(FlowEvent::Completed {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn run_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        emit: &mut (impl FnMut(FlowEvent) + Send),
    ) -> Result<(), FlowError> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let message_id = self.store.append(NewMessage {
            kind: Some(MessageKind::Image),
            ..Default::default()
        });

        let outcome = self.backend.generate_image(prompt).await?;
        self.store.patch(
            &message_id,
            MessagePatch {
                content: Some(outcome.text),
                images: Some(outcome.images),
                ..Default::default()
            },
        );
        emit(FlowEvent::Completed { message_id });
        Ok(())
    }

    async fn run_video(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        emit: &mut (impl FnMut(FlowEvent) + Send),
    ) -> Result<(), FlowError> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let message_id = self.store.append(NewMessage {
            kind: Some(MessageKind::Video),
            content: "Generating video…".to_string(),
            ..Default::default()
        });

        let mut operation = self.backend.start_video(prompt).await?;
        let mut attempts = 0u32;
        while !operation.done {
            if attempts >= VIDEO_POLL_LIMIT {
                return Err(FlowError::VideoTimeout);
            }
            attempts += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                _ = tokio::time::sleep(self.video_poll_interval) => {}
            }
            operation = self.backend.poll_video(&operation.name).await?;
        }

        if let Some(error) = operation.error {
            return Err(FlowError::Generation(GenerationError::Other(error)));
        }
        let uri = operation
            .video_uri
            .ok_or_else(|| GenerationError::Malformed("operation finished without a video".to_string()))?;

        self.store.patch(
            &message_id,
            MessagePatch {
                content: Some("Your video is ready.".to_string()),
                video_uri: Some(uri),
                ..Default::default()
            },
        );
        emit(FlowEvent::Completed { message_id });
        Ok(())
    }

    /// Conversation history as model turns. Error-kind and empty messages
    /// are left out; attachments travel as inline parts.
    fn history_turns(&self) -> Vec<ConversationTurn> {
        self.store
            .messages()
            .into_iter()
            .filter(|m| {
                m.kind != MessageKind::Error && !(m.content.is_empty() && m.attachments.is_empty())
            })
            .map(|m| ConversationTurn {
                role: match m.role {
                    Role::User => TurnRole::User,
                    Role::Assistant => TurnRole::Model,
                },
                text: m.content,
                inline_parts: m
                    .attachments
                    .into_iter()
                    .map(|a| InlinePart {
                        mime_type: a.mime_type,
                        data: a.data,
                    })
                    .collect(),
            })
            .collect()
    }

    fn chat_options(&self, mode: AppMode, thinking: bool) -> GenerateOptions {
        let instruction = match mode {
            AppMode::Canvas => {
                let mut base = CANVAS_SYSTEM_INSTRUCTION.to_string();
                let canvas = self.sessions.canvas();
                if !canvas.is_empty() {
                    base.push_str("\n\nCurrent canvas content:\n");
                    base.push_str(&canvas);
                }
                base
            }
            _ => CHAT_SYSTEM_INSTRUCTION.to_string(),
        };

        GenerateOptions {
            model: if thinking {
                DEFAULT_PRO_MODEL.to_string()
            } else {
                DEFAULT_FLASH_MODEL.to_string()
            },
            system_instruction: Some(instruction),
            thinking_budget: thinking.then_some(THINKING_BUDGET),
            use_search: false,
        }
    }
}
