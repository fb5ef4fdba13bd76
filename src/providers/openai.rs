//! OpenAI-compatible chat completions backend.
//!
//! OpenRouter is the default endpoint; any server speaking the
//! `/chat/completions` protocol works. Streaming uses server-sent events,
//! terminated by `data: [DONE]`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    error_from_status, mask_key, ChunkStream, LineBuffer, LlmProvider, ProviderOutput,
    ProviderRequest, StreamChunk,
};
use crate::error::{ConfigError, ProviderError};
use crate::pricing::ReportedUsage;

/// Default OpenRouter API endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Remote provider for the mid, premium and vision tiers.
pub struct OpenAiCompatibleProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// OpenRouter with the given key.
    pub fn openrouter(api_key: Option<String>) -> Result<Self, ConfigError> {
        Self::new("openrouter", OPENROUTER_BASE_URL, api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// API key for debugging, masked.
    pub fn api_key_masked(&self) -> String {
        self.api_key.as_deref().map(mask_key).unwrap_or_default()
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request<'a>(&self, request: &'a ProviderRequest, stream: bool) -> ApiRequest<'a> {
        ApiRequest {
            model: &request.model,
            messages: vec![ApiMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, body: &ApiRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", "https://llm-proxy.local")
            .header("X-Title", "llm-proxy");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        if body.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(error_from_status(status.as_u16(), &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let body = self.build_request(request, false);
        let response = self.send(&body).await?;
        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("Failed to parse API response: {}", e)))?;

        let content = api
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();

        Ok(ProviderOutput {
            content,
            usage: api.usage.map(ApiUsage::into_reported).unwrap_or_default(),
        })
    }

    fn stream(&self, request: ProviderRequest) -> ChunkStream<'_> {
        Box::pin(async_stream::stream! {
            let body = self.build_request(&request, true);
            let response = match self.send(&body).await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_event(&line) {
                        SseEvent::Skip => {}
                        SseEvent::Done => return,
                        SseEvent::Chunks(items) => {
                            for item in items {
                                yield Ok(item);
                            }
                        }
                        SseEvent::Failed(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if let Some(line) = lines.finish() {
                match parse_event(&line) {
                    SseEvent::Chunks(items) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    SseEvent::Failed(e) => yield Err(e),
                    SseEvent::Skip | SseEvent::Done => {}
                }
            }
        })
    }
}

#[derive(Debug)]
enum SseEvent {
    Skip,
    Done,
    Chunks(Vec<StreamChunk>),
    Failed(ProviderError),
}

/// Interpret one SSE line. Comments, blank lines and non-data fields are skipped.
fn parse_event(line: &str) -> SseEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    if data.is_empty() {
        return SseEvent::Skip;
    }

    let chunk: StreamResponse = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => return SseEvent::Failed(ProviderError::Parse(e.to_string())),
    };
    if let Some(error) = chunk.error {
        return SseEvent::Failed(ProviderError::Stream(error.message));
    }

    let mut items: Vec<StreamChunk> = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.and_then(|d| d.content))
        .filter(|content| !content.is_empty())
        .map(StreamChunk::Text)
        .collect();
    if let Some(usage) = chunk.usage {
        items.push(StreamChunk::Usage(usage.into_reported()));
    }
    SseEvent::Chunks(items)
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    message: Option<ApiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl ApiUsage {
    fn into_reported(self) -> ReportedUsage {
        ReportedUsage {
            tokens_input: self.prompt_tokens,
            tokens_output: self.completion_tokens,
            tokens_total: self.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
