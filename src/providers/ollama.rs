//! Ollama backend, the local provider.
//!
//! Talks to `/api/chat`. Streaming responses are NDJSON: one JSON object per
//! line, the last one carrying `done: true` and the token counts.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    error_from_status, ChunkStream, LineBuffer, LlmProvider, ProviderOutput, ProviderRequest,
    StreamChunk,
};
use crate::error::{ConfigError, ProviderError};
use crate::pricing::ReportedUsage;

/// Default Ollama endpoint.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Local Ollama server.
pub struct OllamaProvider {
    name: String,
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_request<'a>(&self, request: &'a ProviderRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream,
            think: request.think,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.chat_url())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let body = self.build_request(request, false);
        let response = self.send(&body).await?;
        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        chat.into_output()
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
            let mut finished = false;

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_line(&line) {
                        Ok(Some(items)) => {
                            for item in items.chunks {
                                yield Ok(item);
                            }
                            if items.done {
                                finished = true;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                if finished {
                    return;
                }
            }

            if let Some(line) = lines.finish() {
                match parse_line(&line) {
                    Ok(Some(items)) => {
                        for item in items.chunks {
                            yield Ok(item);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        })
    }
}

struct ParsedLine {
    chunks: Vec<StreamChunk>,
    done: bool,
}

/// Parse one NDJSON line. Blank lines yield `None`; an `error` field is a stream error.
fn parse_line(line: &str) -> Result<Option<ParsedLine>, ProviderError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: ChatResponse =
        serde_json::from_str(line).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::Stream(error));
    }

    let mut chunks = Vec::new();
    if let Some(message) = &chunk.message {
        if !message.content.is_empty() {
            chunks.push(StreamChunk::Text(message.content.clone()));
        }
    }
    if chunk.done {
        chunks.push(StreamChunk::Usage(chunk.usage()));
    }
    Ok(Some(ParsedLine {
        chunks,
        done: chunk.done,
    }))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    /// Sent explicitly: thinking models otherwise spend the token budget reasoning.
    think: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl ChatResponse {
    fn usage(&self) -> ReportedUsage {
        ReportedUsage {
            tokens_input: self.prompt_eval_count,
            tokens_output: self.eval_count,
            tokens_total: None,
        }
    }

    fn into_output(self) -> Result<ProviderOutput, ProviderError> {
        if let Some(error) = self.error {
            return Err(ProviderError::Api {
                code: 200,
                message: error,
            });
        }
        let usage = self.usage();
        Ok(ProviderOutput {
            content: self.message.map(|m| m.content).unwrap_or_default(),
            usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
