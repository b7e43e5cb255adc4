//! Request orchestration: translate, make the single backend call, translate back.
//!
//! Streaming exchanges hand their frames to the HTTP layer through a bounded
//! channel fed by a spawned reader task (see [`spawn_stream_pump`]).

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::wrappers::ReceiverStream;

use crate::backend::{LineStream, OllamaClient};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::models::tags_to_openai;
use crate::translate::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    ModelList,
};
use crate::translate::request::RequestTranslator;
use crate::translate::response::{ollama_chat_to_openai, ollama_generate_to_openai};
use crate::translate::streaming::{StreamKind, StreamTranslator};

/// SSE-framed chunks ready to be written to the client, in order.
pub type FrameStream = ReceiverStream<Bytes>;

/// Everything an exchange needs from the process: the backend, the translator
/// built from config, stream tuning and the log.
#[derive(Clone)]
pub struct Proxy {
    pub backend: OllamaClient,
    pub translator: RequestTranslator,
    pub stream: StreamConfig,
    pub logger: SharedLogger,
}

impl Proxy {
    pub async fn chat(&self, req: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let ollama_req = self.translator.chat(req, false);

        self.logger.info(
            "proxy",
            format!(
                "POST {}/api/chat model={}",
                self.backend.base_url(),
                ollama_req.model
            ),
        );

        let ollama_resp = self.backend.chat(&ollama_req).await?;
        let resp = ollama_chat_to_openai(&ollama_resp, req);

        self.logger.info(
            "proxy",
            format!(
                "Completed: prompt={} completion={} tokens (estimated)",
                resp.usage.prompt_tokens, resp.usage.completion_tokens
            ),
        );

        Ok(resp)
    }

    /// Open a streaming chat. Errors returned here happen before any frame exists.
    pub async fn chat_stream(&self, req: &ChatCompletionRequest) -> Result<FrameStream> {
        let ollama_req = self.translator.chat(req, true);

        self.logger.info(
            "proxy",
            format!(
                "POST {}/api/chat model={} (streaming)",
                self.backend.base_url(),
                ollama_req.model
            ),
        );

        let translator = StreamTranslator::new(StreamKind::Chat, &req.model);
        let lines = self.backend.chat_stream(&ollama_req).await?;
        Ok(self.pump(lines, translator))
    }

    pub async fn completion(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        let ollama_req = self.translator.completion(req, false)?;

        self.logger.info(
            "proxy",
            format!(
                "POST {}/api/generate model={}",
                self.backend.base_url(),
                ollama_req.model
            ),
        );

        let ollama_resp = self.backend.generate(&ollama_req).await?;
        Ok(ollama_generate_to_openai(&ollama_resp, req, &ollama_req.prompt))
    }

    pub async fn completion_stream(&self, req: &CompletionRequest) -> Result<FrameStream> {
        let ollama_req = self.translator.completion(req, true)?;

        self.logger.info(
            "proxy",
            format!(
                "POST {}/api/generate model={} (streaming)",
                self.backend.base_url(),
                ollama_req.model
            ),
        );

        let translator = StreamTranslator::new(StreamKind::Completion, &req.model);
        let lines = self.backend.generate_stream(&ollama_req).await?;
        Ok(self.pump(lines, translator))
    }

    pub async fn models(&self) -> Result<ModelList> {
        let tags = self.backend.tags().await?;
        Ok(tags_to_openai(&tags))
    }

    fn pump(&self, lines: LineStream, translator: StreamTranslator) -> FrameStream {
        spawn_stream_pump(lines, translator, &self.stream, self.logger.clone())
    }
}

/// Run the backend read loop on its own task and return the receiving end.
///
/// Frames are sent in the order their lines arrived. The task ends (closing the
/// channel) after `[DONE]`, on a backend read error or error line, at backend
/// EOF, when the receiver is dropped, or when a send waits longer than
/// `send_timeout_secs`. Ending drops the backend response, which closes the
/// connection.
pub fn spawn_stream_pump<L>(
    lines: L,
    mut translator: StreamTranslator,
    settings: &StreamConfig,
    logger: SharedLogger,
) -> FrameStream
where
    L: Stream<Item = Result<String>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(settings.channel_capacity.max(1));
    let send_timeout = Duration::from_secs(settings.send_timeout_secs);

    tokio::spawn(async move {
        tokio::pin!(lines);
        let mut frames_sent: usize = 0;
        let truncated = |level: LogLevel, message: String, frames_sent: usize, id: &str| {
            logger.log_with_context(
                level,
                "stream",
                message,
                serde_json::json!({ "id": id, "frames_sent": frames_sent }),
            );
        };

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    truncated(
                        LogLevel::Warn,
                        format!("Client disconnected after {frames_sent} frames, dropping backend stream"),
                        frames_sent,
                        translator.id(),
                    );
                    return;
                }
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    truncated(
                        LogLevel::Error,
                        format!("Backend stream failed after {frames_sent} frames: {e}"),
                        frames_sent,
                        translator.id(),
                    );
                    return;
                }
                None => {
                    if !translator.is_finished() {
                        truncated(
                            LogLevel::Warn,
                            format!("Backend stream ended without done chunk after {frames_sent} frames"),
                            frames_sent,
                            translator.id(),
                        );
                    }
                    return;
                }
            };

            let frames = match translator.process_line(&line) {
                Ok(frames) => frames,
                Err(e) => {
                    truncated(
                        LogLevel::Error,
                        format!("Backend stream failed after {frames_sent} frames: {e}"),
                        frames_sent,
                        translator.id(),
                    );
                    return;
                }
            };
            if frames.is_empty() && !line.trim().is_empty() {
                logger.debug("stream", "Skipping unparseable backend line");
            }

            for frame in frames {
                match tx.send_timeout(Bytes::from(frame.to_sse()), send_timeout).await {
                    Ok(()) => frames_sent += 1,
                    Err(SendTimeoutError::Timeout(_)) => {
                        logger.warn(
                            "stream",
                            format!("Client stalled for {send_timeout:?}, abandoning stream"),
                        );
                        return;
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        logger.warn("stream", "Client disconnected, dropping backend stream");
                        return;
                    }
                }
            }

            if translator.is_finished() {
                logger.info(
                    "stream",
                    format!("Stream {} completed ({frames_sent} frames)", translator.id()),
                );
                return;
            }
        }
    });

    ReceiverStream::new(rx)
}
