//! Model provider backends.
//!
//! Every backend implements [`LlmProvider`]: a one-shot `execute` call and a
//! token `stream`. Backends are registered by name in a
//! [`ProviderRegistry`], which refuses to start without a local provider.
//!
//! - [`OllamaProvider`]: the local, privacy-safe provider
//! - [`OpenAiCompatibleProvider`]: OpenRouter or any OpenAI-style endpoint

mod ollama;
mod openai;
mod registry;

pub use ollama::{OllamaProvider, OLLAMA_BASE_URL};
pub use openai::{OpenAiCompatibleProvider, OPENROUTER_BASE_URL};
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::error::ProviderError;
use crate::pricing::ReportedUsage;
use crate::task::Task;

/// One item of a provider token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A piece of generated text. May be empty.
    Text(String),
    /// Token usage, usually sent once near the end.
    Usage(ReportedUsage),
}

/// Boxed provider token stream.
pub type ChunkStream<'a> =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send + 'a>>;

/// Minimal chat request handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Enable the model's reasoning mode. Off unless the task asks for it.
    pub think: bool,
}

impl ProviderRequest {
    pub fn from_task(task: &Task, model: &str) -> Self {
        Self {
            model: model.to_string(),
            prompt: task.prompt.clone(),
            temperature: task.temperature,
            max_tokens: task.max_tokens,
            think: task.deep_reasoning,
        }
    }
}

/// Result of a one-shot provider call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOutput {
    pub content: String,
    pub usage: ReportedUsage,
}

/// A model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name, also used as the ledger's provider label.
    fn name(&self) -> &str;

    /// Whether this backend runs on infrastructure that may see sensitive data.
    fn is_local(&self) -> bool;

    /// Run one request to completion.
    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError>;

    /// Stream a response. The default runs `execute` and emits the whole
    /// completion as one chunk.
    fn stream(&self, request: ProviderRequest) -> ChunkStream<'_> {
        Box::pin(async_stream::stream! {
            match self.execute(&request).await {
                Ok(output) => {
                    yield Ok(StreamChunk::Text(output.content));
                    yield Ok(StreamChunk::Usage(output.usage));
                }
                Err(e) => yield Err(e),
            }
        })
    }
}

/// Map a non-2xx response to a provider error.
///
/// 429 becomes `RateLimited`; anything else becomes `Api` with the
/// structured error message when the body carries one.
pub(crate) fn error_from_status(status: u16, body: &str) -> ProviderError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Structured { message: String },
        Plain(String),
    }

    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorDetail::Structured { message },
        })
        | Ok(ErrorBody {
            error: ErrorDetail::Plain(message),
        }) => message,
        Err(_) => body.trim().to_string(),
    };

    if status == 429 {
        ProviderError::RateLimited(message)
    } else {
        ProviderError::Api {
            code: status,
            message,
        }
    }
}

/// Splits a byte stream into lines across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every complete line, without terminators.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Mask a secret for logs: first and last four characters only.
pub(crate) fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use futures::StreamExt;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        fn is_local(&self) -> bool {
            true
        }
        async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            Ok(ProviderOutput {
                content: request.prompt.to_uppercase(),
                usage: ReportedUsage::default(),
            })
        }
    }

    #[test]
    fn test_request_from_task_disables_thinking_by_default() {
        let task = Task::new(TaskType::Generation, "hi").with_max_tokens(64);
        let request = ProviderRequest::from_task(&task, "qwen3:8b");
        assert_eq!(request.model, "qwen3:8b");
        assert_eq!(request.max_tokens, 64);
        assert!(!request.think);

        let request = ProviderRequest::from_task(&task.with_deep_reasoning(), "qwen3:8b");
        assert!(request.think);
    }

    #[tokio::test]
    async fn test_default_stream_emits_single_chunk() {
        let provider = EchoProvider;
        let task = Task::new(TaskType::Generation, "hello");
        let chunks: Vec<_> = provider
            .stream(ProviderRequest::from_task(&task, "m"))
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].as_ref().unwrap(),
            &StreamChunk::Text("HELLO".to_string())
        );
    }

    #[test]
    fn test_error_from_status() {
        let err = error_from_status(429, r#"{"error":{"message":"slow down"}}"#);
        assert!(matches!(err, ProviderError::RateLimited(ref m) if m == "slow down"));

        let err = error_from_status(500, r#"{"error":"model crashed"}"#);
        assert!(matches!(err, ProviderError::Api { code: 500, ref message } if message == "model crashed"));

        let err = error_from_status(502, "bad gateway\n");
        assert!(matches!(err, ProviderError::Api { code: 502, ref message } if message == "bad gateway"));
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.push(b":2}\n\n"), vec!["{\"b\":2}", ""]);
        assert_eq!(buf.finish(), None);

        buf.push(b"tail");
        assert_eq!(buf.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("sk-or-1234567890"), "sk-o...7890");
    }
}
