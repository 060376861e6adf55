//! Scriptable generation backend shared by module tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::providers::{
    ConversationTurn, DeltaStream, GenerateOptions, GenerationBackend, GenerationError,
    GroundingUrl, ImageOutcome, SearchOutcome, StreamDelta, VideoOperation,
};

pub fn delta(text: &str) -> StreamDelta {
    StreamDelta {
        text: text.to_string(),
        grounding_urls: Vec::new(),
    }
}

pub fn url(title: &str, uri: &str) -> GroundingUrl {
    GroundingUrl {
        title: title.to_string(),
        uri: uri.to_string(),
    }
}

pub fn outcome(text: &str, urls: Vec<GroundingUrl>) -> SearchOutcome {
    SearchOutcome {
        text: text.to_string(),
        grounding_urls: urls,
    }
}

#[derive(Default)]
pub struct MockBackend {
    plan: Mutex<Option<Result<String, GenerationError>>>,
    searches: Mutex<VecDeque<Result<SearchOutcome, GenerationError>>>,
    report: Mutex<Option<Result<Vec<StreamDelta>, GenerationError>>>,
    video_polls: Mutex<VecDeque<VideoOperation>>,
    cancel_after_searches: Mutex<Option<(usize, CancellationToken)>>,
    plan_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    plan_gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    pub plan_prompts: Mutex<Vec<String>>,
    pub search_prompts: Mutex<Vec<String>>,
    pub report_prompts: Mutex<Vec<String>>,
    pub chat_turn_counts: Mutex<Vec<usize>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, result: Result<String, GenerationError>) {
        *self.plan.lock().unwrap() = Some(result);
    }

    pub fn push_search(&self, result: Result<SearchOutcome, GenerationError>) {
        self.searches.lock().unwrap().push_back(result);
    }

    pub fn set_report_chunks(&self, chunks: Vec<StreamDelta>) {
        *self.report.lock().unwrap() = Some(Ok(chunks));
    }

    pub fn set_report_error(&self, err: GenerationError) {
        *self.report.lock().unwrap() = Some(Err(err));
    }

    pub fn push_video_poll(&self, operation: VideoOperation) {
        self.video_polls.lock().unwrap().push_back(operation);
    }

    /// Fire `token` once the n-th search request has been served.
    pub fn cancel_after_searches(&self, count: usize, token: CancellationToken) {
        *self.cancel_after_searches.lock().unwrap() = Some((count, token));
    }

    /// Run `hook` while the next plan request is in flight, before its
    /// result is returned.
    pub fn set_plan_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.plan_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Make the next plan request suspend until the returned sender fires.
    pub fn hold_next_plan(&self) -> tokio::sync::oneshot::Sender<()> {
        let (release, gate) = tokio::sync::oneshot::channel();
        *self.plan_gate.lock().unwrap() = Some(gate);
        release
    }

    pub fn search_count(&self) -> usize {
        self.search_prompts.lock().unwrap().len()
    }

    pub fn report_count(&self) -> usize {
        self.report_prompts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl GenerationBackend for MockBackend {
    async fn create_plan(&self, prompt: &str) -> Result<String, GenerationError> {
        self.plan_prompts.lock().unwrap().push(prompt.to_string());

        let gate = self.plan_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(hook) = self.plan_hook.lock().unwrap().as_ref() {
            hook();
        }

        self.plan.lock().unwrap().take().unwrap_or_else(|| {
            Ok(r#"["Survey\n(1) default goal", "Analyze", "Report"]"#.to_string())
        })
    }

    async fn search(&self, prompt: &str) -> Result<SearchOutcome, GenerationError> {
        self.search_prompts.lock().unwrap().push(prompt.to_string());
        let result = self
            .searches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(outcome("a finding", Vec::new())));

        let served = self.search_count();
        if let Some((count, token)) = self.cancel_after_searches.lock().unwrap().as_ref() {
            if served == *count {
                token.cancel();
            }
        }

        result
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError> {
        self.report_prompts.lock().unwrap().push(prompt.to_string());
        let chunks = self
            .report
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Ok(vec![delta("synthesized report")]))?;
        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok),
        )))
    }

    async fn stream_chat(
        &self,
        turns: &[ConversationTurn],
        options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError> {
        self.chat_turn_counts.lock().unwrap().push(turns.len());
        let last = turns.last().map(|t| t.text.clone()).unwrap_or_default();
        self.stream_generate(&last, options).await
    }

    async fn generate_image(&self, _prompt: &str) -> Result<ImageOutcome, GenerationError> {
        Ok(ImageOutcome {
            images: vec!["data:image/png;base64,AA==".to_string()],
            text: "generated".to_string(),
        })
    }

    async fn start_video(&self, _prompt: &str) -> Result<VideoOperation, GenerationError> {
        Ok(VideoOperation {
            name: "operations/mock".to_string(),
            done: false,
            video_uri: None,
            error: None,
        })
    }

    async fn poll_video(&self, operation_name: &str) -> Result<VideoOperation, GenerationError> {
        Ok(self
            .video_polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| VideoOperation {
                name: operation_name.to_string(),
                done: true,
                video_uri: Some("https://video.example/clip".to_string()),
                error: None,
            }))
    }
}
