// Gemini REST provider
//
// Talks to the Generative Language API directly over reqwest. Streaming
// endpoints are consumed as SSE (`alt=sse`) with a line buffer, the same way
// the custom providers handle their chat-completions streams.

use async_stream::stream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use super::{
    ConversationTurn, DeltaStream, GenerateOptions, GenerationBackend, GenerationError,
    GroundingUrl, ImageOutcome, SearchOutcome, StreamDelta, TurnRole, VideoOperation,
    DEFAULT_IMAGE_MODEL, DEFAULT_PRO_MODEL, DEFAULT_VIDEO_MODEL,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const PLAN_SYSTEM_INSTRUCTION: &str =
    "You are a research planner. Respond with strict JSON only, no markdown, no commentary.";

const SEARCH_SYSTEM_INSTRUCTION: &str = "You are an expert researcher. Use web search to verify \
facts. Prefer concrete, technical and quantitative findings over generic summary.";

/// Gemini API client
#[derive(Clone, Debug)]
pub struct GeminiClient {
    api_key: String,
    base_url: String,
    text_model: String,
    image_model: String,
    video_model: String,
    http: reqwest::Client,
}

pub struct GeminiClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    text_model: Option<String>,
}

impl GeminiClient {
    pub fn builder() -> GeminiClientBuilder {
        GeminiClientBuilder {
            api_key: None,
            base_url: None,
            text_model: None,
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url, model, method, self.api_key
        )
    }

    fn operation_url(&self, operation_name: &str) -> String {
        format!(
            "{}/{}?key={}",
            self.base_url,
            operation_name.trim_start_matches('/'),
            self.api_key
        )
    }

    async fn generate_content(&self, model: &str, body: Value) -> Result<Value, GenerationError> {
        let resp = self
            .http
            .post(self.model_url(model, "generateContent"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.json::<Value>().await?)
    }

    async fn open_stream(&self, model: &str, body: Value) -> Result<DeltaStream, GenerationError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );
        let resp = self.http.post(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut byte_stream = resp.bytes_stream();

        let deltas = stream! {
            let mut lines_buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(GenerationError::Request(err));
                        break;
                    }
                };

                lines_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = lines_buffer.find('\n') {
                    let line = lines_buffer[..line_end].trim().to_string();
                    lines_buffer = lines_buffer[line_end + 1..].to_string();

                    if line.is_empty() {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break;
                    }

                    match serde_json::from_str::<Value>(data) {
                        Ok(payload) => {
                            yield Ok(StreamDelta {
                                text: extract_text(&payload),
                                grounding_urls: extract_grounding(&payload),
                            });
                        }
                        Err(err) => {
                            warn!("skipping unparseable stream chunk: {err}");
                        }
                    }
                }
            }
        };

        Ok(Box::pin(deltas))
    }
}

impl GeminiClientBuilder {
    pub fn api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.trim_end_matches('/').to_string());
        self
    }

    pub fn text_model(mut self, model: &str) -> Self {
        self.text_model = Some(model.to_string());
        self
    }

    pub fn build(self) -> Result<GeminiClient, GenerationError> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GenerationError::Other("API key is required".to_string()))?;
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Url::parse(&base_url)
            .map_err(|err| GenerationError::Other(format!("invalid base url: {err}")))?;

        Ok(GeminiClient {
            api_key,
            base_url,
            text_model: self
                .text_model
                .unwrap_or_else(|| DEFAULT_PRO_MODEL.to_string()),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl GenerationBackend for GeminiClient {
    async fn create_plan(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "systemInstruction": { "parts": [{ "text": PLAN_SYSTEM_INSTRUCTION }] },
            "generationConfig": {
                "temperature": 0.7,
                "responseMimeType": "application/json",
            },
        });
        let payload = self.generate_content(&self.text_model, body).await?;
        let text = extract_text(&payload);
        if text.is_empty() {
            return Err(GenerationError::Malformed(
                "plan response carried no text".to_string(),
            ));
        }
        Ok(text)
    }

    async fn search(&self, prompt: &str) -> Result<SearchOutcome, GenerationError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "systemInstruction": { "parts": [{ "text": SEARCH_SYSTEM_INSTRUCTION }] },
            "generationConfig": { "temperature": 0.7, "topP": 0.95, "topK": 40 },
            "tools": [{ "google_search": {} }],
        });
        let payload = self.generate_content(&self.text_model, body).await?;
        Ok(SearchOutcome {
            text: extract_text(&payload),
            grounding_urls: extract_grounding(&payload),
        })
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError> {
        let turns = [ConversationTurn {
            role: TurnRole::User,
            text: prompt.to_string(),
            inline_parts: Vec::new(),
        }];
        self.stream_chat(&turns, options).await
    }

    async fn stream_chat(
        &self,
        turns: &[ConversationTurn],
        options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError> {
        let model = if options.model.is_empty() {
            self.text_model.clone()
        } else {
            options.model.clone()
        };
        let body = build_stream_body(turns, options);
        self.open_stream(&model, body).await
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImageOutcome, GenerationError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "imageConfig": { "aspectRatio": "1:1" } },
        });
        let payload = self.generate_content(&self.image_model, body).await?;
        Ok(extract_image_outcome(&payload))
    }

    async fn start_video(&self, prompt: &str) -> Result<VideoOperation, GenerationError> {
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "resolution": "720p",
                "aspectRatio": "16:9",
            },
        });
        let resp = self
            .http
            .post(self.model_url(&self.video_model, "predictLongRunning"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload = resp.json::<Value>().await?;
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GenerationError::Malformed("video operation carried no name".to_string())
            })?
            .to_string();

        Ok(parse_video_operation(name, &payload))
    }

    async fn poll_video(&self, operation_name: &str) -> Result<VideoOperation, GenerationError> {
        let resp = self
            .http
            .get(self.operation_url(operation_name))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload = resp.json::<Value>().await?;
        Ok(parse_video_operation(operation_name.to_string(), &payload))
    }
}

fn build_stream_body(turns: &[ConversationTurn], options: &GenerateOptions) -> Value {
    let contents = turns
        .iter()
        .map(|turn| {
            let mut parts = Vec::new();
            if !turn.text.is_empty() {
                parts.push(json!({ "text": turn.text }));
            }
            for inline in &turn.inline_parts {
                parts.push(json!({
                    "inlineData": { "mimeType": inline.mime_type, "data": inline.data }
                }));
            }
            json!({
                "role": match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Model => "model",
                },
                "parts": parts,
            })
        })
        .collect::<Vec<_>>();

    let mut generation_config = json!({ "temperature": 0.7, "topP": 0.95, "topK": 40 });
    if let Some(budget) = options.thinking_budget {
        generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget });
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if let Some(instruction) = &options.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if options.use_search {
        body["tools"] = json!([{ "google_search": {} }]);
    }
    body
}

/// Concatenate text parts of the first candidate, skipping thought parts
/// (Gemini marks reasoning with `"thought": true`).
fn extract_text(payload: &Value) -> String {
    payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| part.get("thought").and_then(Value::as_bool) != Some(true))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn extract_grounding(payload: &Value) -> Vec<GroundingUrl> {
    payload
        .pointer("/candidates/0/groundingMetadata/groundingChunks")
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| {
                    let web = chunk.get("web")?;
                    Some(GroundingUrl {
                        title: web.get("title")?.as_str()?.to_string(),
                        uri: web.get("uri")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_image_outcome(payload: &Value) -> ImageOutcome {
    let mut images = Vec::new();
    let mut texts = Vec::new();

    if let Some(parts) = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(inline) = part.get("inlineData") {
                let mime = inline
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                if let Some(data) = inline.get("data").and_then(Value::as_str) {
                    images.push(format!("data:{};base64,{}", mime, data));
                }
            } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
        }
    }

    ImageOutcome {
        images,
        text: texts.join("\n"),
    }
}

fn parse_video_operation(name: String, payload: &Value) -> VideoOperation {
    let done = payload.get("done").and_then(Value::as_bool).unwrap_or(false);
    let video_uri = payload
        .pointer("/response/generateVideoResponse/generatedSamples/0/video/uri")
        .or_else(|| payload.pointer("/response/generatedVideos/0/video/uri"))
        .and_then(Value::as_str)
        .map(|uri| uri.to_string());
    let error = payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(|message| message.to_string());

    VideoOperation {
        name,
        done,
        video_uri,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InlinePart;

    #[test]
    fn extract_text_joins_parts_and_skips_thoughts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "Hello" },
                        { "thought": true, "text": "internal reasoning" },
                        { "text": ", world" },
                    ]
                }
            }]
        });
        assert_eq!(extract_text(&payload), "Hello, world");
    }

    #[test]
    fn extract_text_handles_missing_candidates() {
        assert_eq!(extract_text(&json!({})), "");
    }

    #[test]
    fn extract_grounding_keeps_only_complete_web_chunks() {
        let payload = json!({
            "candidates": [{
                "groundingMetadata": {
                    "groundingChunks": [
                        { "web": { "title": "A", "uri": "https://a.example" } },
                        { "web": { "title": "B" } },
                        { "retrievedContext": { "uri": "ignored" } },
                    ]
                }
            }]
        });
        let urls = extract_grounding(&payload);
        assert_eq!(
            urls,
            vec![GroundingUrl {
                title: "A".to_string(),
                uri: "https://a.example".to_string(),
            }]
        );
    }

    #[test]
    fn extract_image_outcome_builds_data_uris() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "A red square" },
                        { "inlineData": { "mimeType": "image/png", "data": "QUJD" } },
                    ]
                }
            }]
        });
        let outcome = extract_image_outcome(&payload);
        assert_eq!(outcome.images, vec!["data:image/png;base64,QUJD"]);
        assert_eq!(outcome.text, "A red square");
    }

    #[test]
    fn parse_video_operation_reads_done_flag_and_uri() {
        let pending = parse_video_operation("operations/x".to_string(), &json!({}));
        assert!(!pending.done);
        assert!(pending.video_uri.is_none());

        let finished = parse_video_operation(
            "operations/x".to_string(),
            &json!({
                "done": true,
                "response": {
                    "generateVideoResponse": {
                        "generatedSamples": [{ "video": { "uri": "https://v.example/clip" } }]
                    }
                }
            }),
        );
        assert!(finished.done);
        assert_eq!(finished.video_uri.as_deref(), Some("https://v.example/clip"));
    }

    #[test]
    fn stream_body_carries_history_attachments_and_search_tool() {
        let turns = vec![
            ConversationTurn {
                role: TurnRole::User,
                text: "look at this".to_string(),
                inline_parts: vec![InlinePart {
                    mime_type: "image/jpeg".to_string(),
                    data: "QUJD".to_string(),
                }],
            },
            ConversationTurn {
                role: TurnRole::Model,
                text: "looking".to_string(),
                inline_parts: Vec::new(),
            },
        ];
        let options = GenerateOptions {
            model: String::new(),
            system_instruction: Some("be helpful".to_string()),
            thinking_budget: Some(16384),
            use_search: true,
        };

        let body = build_stream_body(&turns, &options);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(
            body["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            "image/jpeg"
        );
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            16384
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be helpful");
        assert!(body["tools"][0].get("google_search").is_some());
    }
}
