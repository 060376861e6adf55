//! HTTP surface
//! axum router over the flow services; streaming endpoints bridge flow
//! events onto SSE through an unbounded channel.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Json, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::modules::chat::{ChatService, FlowEvent, SubmitRequest};
use crate::modules::conversation::{Attachment, ConversationStore, Message};
use crate::modules::session::{AppMode, ChatSession, SessionController};
use crate::providers::GenerationBackend;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<ConversationStore>,
    sessions: Arc<SessionController>,
    chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        let store = Arc::new(ConversationStore::new());
        let sessions = Arc::new(SessionController::new());
        let chat = Arc::new(ChatService::new(backend, store.clone(), sessions.clone()));
        Self {
            store,
            sessions,
            chat,
        }
    }
}

pub async fn serve(
    config: ServerConfig,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins = config
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id/switch", post(switch_session))
        .route("/api/messages", get(list_messages))
        .route("/api/chat", post(chat))
        .route("/api/research", post(propose_research))
        .route("/api/research/:id/start", post(start_research))
        .route("/api/image", post(generate_image))
        .route("/api/video", post(generate_video))
        .route("/api/stop", post(stop))
        .with_state(state)
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("lumo backend listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<ChatSession>> {
    Json(state.sessions.list())
}

async fn create_session(State(state): State<AppState>) -> Json<ChatSession> {
    Json(state.sessions.create(&state.store))
}

async fn switch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<Value>)> {
    if !state.sessions.switch(&id, &state.store) {
        return Err(not_found("Unknown session"));
    }
    Ok(Json(state.store.messages()))
}

async fn list_messages(State(state): State<AppState>) -> Json<Vec<Message>> {
    Json(state.store.messages())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    content: String,
    #[serde(default)]
    mode: AppMode,
    #[serde(default)]
    thinking: bool,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

async fn chat(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    if payload.content.trim().is_empty() {
        return Err(bad_request("Missing required field: content"));
    }
    if state.chat.is_generating() {
        return Err(conflict("A generation is already in progress"));
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let request = SubmitRequest {
        content: payload.content,
        mode: payload.mode,
        thinking: payload.thinking,
        attachments: payload.attachments,
    };
    tokio::spawn(run_submit(state.chat.clone(), request, tx));

    Ok(Sse::new(event_stream(rx)))
}

/// Drive a submission, forwarding its events to the channel. A rejected
/// submission (another generation won the race) surfaces as an error event
/// on the same channel instead of a silently empty stream.
async fn run_submit(
    chat: Arc<ChatService>,
    request: SubmitRequest,
    tx: UnboundedSender<FlowEvent>,
) {
    let rejections = tx.clone();
    if let Err(err) = chat
        .submit(request, move |event| {
            let _ = tx.send(event);
        })
        .await
    {
        error!("chat submit rejected: {err}");
        let _ = rejections.send(FlowEvent::Error {
            message_id: String::new(),
            message: err.to_string(),
        });
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResearchRequest {
    query: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResearchProposal {
    message_id: String,
    steps: Vec<String>,
}

async fn propose_research(
    State(state): State<AppState>,
    Json(payload): Json<ResearchRequest>,
) -> Result<Json<ResearchProposal>, (StatusCode, Json<Value>)> {
    if payload.query.trim().is_empty() {
        return Err(bad_request("Missing required field: query"));
    }

    let proposal = Arc::new(Mutex::new(None));
    let sink = proposal.clone();
    let request = SubmitRequest {
        content: payload.query,
        mode: AppMode::DeepResearch,
        ..Default::default()
    };
    state
        .chat
        .submit(request, move |event| {
            if let FlowEvent::PlanProposed { message_id, steps } = event {
                *sink.lock().expect("proposal slot poisoned") =
                    Some(ResearchProposal { message_id, steps });
            }
        })
        .await
        .map_err(|err| conflict(&err.to_string()))?;

    let proposal = proposal
        .lock()
        .expect("proposal slot poisoned")
        .take()
        .ok_or_else(|| internal_error("planning produced no proposal".to_string()))?;
    Ok(Json(proposal))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResearchRequest {
    steps: Vec<String>,
}

async fn start_research(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<StartResearchRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    if payload.steps.is_empty() {
        return Err(bad_request("Missing required field: steps"));
    }
    if state.chat.is_generating() {
        return Err(conflict("A generation is already in progress"));
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let chat = state.chat.clone();
    tokio::spawn(async move {
        let rejections = tx.clone();
        if let Err(err) = chat
            .start_research(&id, payload.steps, move |event| {
                let _ = tx.send(event);
            })
            .await
        {
            error!("start-research rejected: {err}");
            let _ = rejections.send(FlowEvent::Error {
                message_id: String::new(),
                message: err.to_string(),
            });
        }
    });

    Ok(Sse::new(event_stream(rx)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptRequest {
    prompt: String,
}

async fn generate_image(
    State(state): State<AppState>,
    Json(payload): Json<PromptRequest>,
) -> Result<Json<Message>, (StatusCode, Json<Value>)> {
    run_media_flow(state, payload.prompt, AppMode::Image).await
}

async fn generate_video(
    State(state): State<AppState>,
    Json(payload): Json<PromptRequest>,
) -> Result<Json<Message>, (StatusCode, Json<Value>)> {
    run_media_flow(state, payload.prompt, AppMode::Video).await
}

/// Media flows finish with a single result message; run the flow to
/// completion and return that message.
async fn run_media_flow(
    state: AppState,
    prompt: String,
    mode: AppMode,
) -> Result<Json<Message>, (StatusCode, Json<Value>)> {
    if prompt.trim().is_empty() {
        return Err(bad_request("Missing required field: prompt"));
    }

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let request = SubmitRequest {
        content: prompt,
        mode,
        ..Default::default()
    };
    state
        .chat
        .submit(request, move |event| {
            sink.lock().expect("event sink poisoned").push(event);
        })
        .await
        .map_err(|err| conflict(&err.to_string()))?;

    let events = events.lock().expect("event sink poisoned");
    for event in events.iter() {
        match event {
            FlowEvent::Completed { message_id } => {
                return state
                    .store
                    .get(message_id)
                    .map(Json)
                    .ok_or_else(|| internal_error("result message disappeared".to_string()));
            }
            FlowEvent::Error { message, .. } => {
                return Err(internal_error(message.clone()));
            }
            _ => {}
        }
    }
    Err(internal_error("generation produced no result".to_string()))
}

async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.chat.stop();
    Json(json!({ "stopped": true }))
}

fn event_stream(rx: UnboundedReceiver<FlowEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    UnboundedReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(payload))
    })
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

fn conflict(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::CONFLICT, Json(json!({ "error": message })))
}

fn internal_error(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}
