//! HTTP client for the native Ollama API.
//!
//! One call per method, no retries. Error details are kept in [`ProxyError::Backend`]
//! for logging; the HTTP layer never shows them to API callers.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};
use crate::translate::ollama_types::{
    OllamaChatRequest, OllamaChatResponse, OllamaGenerateRequest, OllamaGenerateResponse,
    OllamaTagsResponse,
};

/// Lines of an NDJSON response body, in arrival order.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Build a client whose every call is bounded by `timeout_secs`.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, req: &OllamaChatRequest) -> Result<OllamaChatResponse> {
        let response = self.post("/api/chat", req).await?;
        decode(response).await
    }

    /// Start a streaming chat. Connection and status failures surface here,
    /// before any line has been read.
    pub async fn chat_stream(&self, req: &OllamaChatRequest) -> Result<LineStream> {
        let response = self.post("/api/chat", req).await?;
        Ok(Box::pin(ndjson_lines(response.bytes_stream())))
    }

    pub async fn generate(&self, req: &OllamaGenerateRequest) -> Result<OllamaGenerateResponse> {
        let response = self.post("/api/generate", req).await?;
        decode(response).await
    }

    pub async fn generate_stream(&self, req: &OllamaGenerateRequest) -> Result<LineStream> {
        let response = self.post("/api/generate", req).await?;
        Ok(Box::pin(ndjson_lines(response.bytes_stream())))
    }

    pub async fn tags(&self) -> Result<OllamaTagsResponse> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::backend(format!("GET {url} failed: {e}")))?;
        decode(check_status(response).await?).await
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::backend(format!("POST {url} failed: {e}")))?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::backend(format!(
        "Ollama returned status {}: {}",
        status.as_u16(),
        truncate(&body, 500)
    )))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::backend(format!("Failed to read response body: {e}")))?;

    serde_json::from_str(&body).map_err(|e| {
        ProxyError::backend(format!(
            "Failed to decode Ollama response: {}. Body: {}",
            e,
            truncate(&body, 300)
        ))
    })
}

/// Longest backend line accepted before the stream is abandoned.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Split a byte stream into lines. Bytes are buffered until a newline so
/// multi-byte characters split across reads decode intact. A trailing line
/// without a newline is yielded at EOF.
pub fn ndjson_lines<S, E>(byte_stream: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    split_lines(byte_stream, MAX_LINE_BYTES)
}

/// A line growing past `max_line` yields an error and ends the stream.
fn split_lines<S, E>(
    byte_stream: S,
    max_line: usize,
) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // bytes of `buffer` already known to hold no newline
        let mut scanned = 0;
        tokio::pin!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(ProxyError::backend(format!("Stream read failed: {e}")));
                    return;
                }
            };

            buffer.extend_from_slice(&chunk);

            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let pos = scanned + offset;
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                scanned = 0;
                yield Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            scanned = buffer.len();

            if buffer.len() > max_line {
                yield Err(ProxyError::backend(format!(
                    "Backend line exceeds {max_line} bytes"
                )));
                return;
            }
        }

        if !buffer.is_empty() {
            yield Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
