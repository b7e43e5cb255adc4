//! State machine for translating Ollama NDJSON stream lines into OpenAI SSE frames.
//!
//! A [`StreamTranslator`] is created once per exchange, which fixes the
//! `id`/`created` pair every emitted chunk carries. It is fed one backend line
//! at a time and returns the frames to write. After the backend's `done` chunk
//! it emits the `[DONE]` sentinel and ignores any further input. An
//! `{"error": ...}` line ends the stream as a backend failure, without `[DONE]`.

use chrono::Utc;
use serde::Serialize;

use super::ollama_types::{OllamaChatResponse, OllamaGenerateResponse, OllamaStreamError};
use super::openai_types::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, CompletionChoice, CompletionChunk,
};
use super::response::{next_id, FINISH_STOP};
use crate::error::{ProxyError, Result};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One unit written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A serialized OpenAI chunk.
    Data(String),
    /// The terminal sentinel.
    Done,
}

impl StreamFrame {
    /// SSE wire form: `data: <payload>\n\n`.
    pub fn to_sse(&self) -> String {
        match self {
            StreamFrame::Data(json) => format!("data: {json}\n\n"),
            StreamFrame::Done => DONE_FRAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `/api/chat` lines into `chat.completion.chunk` objects.
    Chat,
    /// `/api/generate` lines into streamed `text_completion` objects.
    Completion,
}

/// A backend line reduced to what the client chunk needs.
struct ParsedChunk {
    text: String,
    done: bool,
}

#[derive(Debug)]
pub struct StreamTranslator {
    kind: StreamKind,
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
    finished: bool,
}

impl StreamTranslator {
    /// `model` is the name the caller asked for; it is echoed in every chunk.
    pub fn new(kind: StreamKind, model: &str) -> Self {
        let prefix = match kind {
            StreamKind::Chat => "chatcmpl",
            StreamKind::Completion => "cmpl",
        };
        Self {
            kind,
            id: next_id(prefix),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            role_sent: false,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    fn created(&self) -> i64 {
        self.created
    }

    /// True once the stream has ended, by a `done` chunk or an error line.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one backend line. Blank and unparseable lines produce nothing.
    ///
    /// An error line reported by Ollama is returned as [`ProxyError::Backend`]
    /// and finishes the translator without emitting the sentinel.
    pub fn process_line(&mut self, line: &str) -> Result<Vec<StreamFrame>> {
        if self.finished {
            return Ok(Vec::new());
        }

        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        if let Ok(failure) = serde_json::from_str::<OllamaStreamError>(line) {
            self.finished = true;
            return Err(ProxyError::backend(format!(
                "Ollama reported a stream error: {}",
                failure.error
            )));
        }

        let Some(chunk) = self.parse(line) else {
            return Ok(Vec::new());
        };

        let finish_reason = chunk.done.then(|| FINISH_STOP.to_string());
        let payload = match self.kind {
            StreamKind::Chat => self.chat_chunk(chunk.text, finish_reason),
            StreamKind::Completion => self.completion_chunk(chunk.text, finish_reason),
        };

        let mut frames = Vec::with_capacity(2);
        if let Some(json) = payload {
            frames.push(StreamFrame::Data(json));
        }
        if chunk.done {
            self.finished = true;
            frames.push(StreamFrame::Done);
        }
        Ok(frames)
    }

    fn parse(&self, line: &str) -> Option<ParsedChunk> {
        match self.kind {
            StreamKind::Chat => serde_json::from_str::<OllamaChatResponse>(line)
                .ok()
                .map(|c| ParsedChunk {
                    text: c.message.content,
                    done: c.done,
                }),
            StreamKind::Completion => serde_json::from_str::<OllamaGenerateResponse>(line)
                .ok()
                .map(|c| ParsedChunk {
                    text: c.response,
                    done: c.done,
                }),
        }
    }

    fn chat_chunk(&mut self, text: String, finish_reason: Option<String>) -> Option<String> {
        let role = (!self.role_sent).then(|| "assistant".to_string());
        self.role_sent = true;

        encode(&ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role,
                    content: Some(text).filter(|t| !t.is_empty()),
                },
                finish_reason,
            }],
        })
    }

    fn completion_chunk(&self, text: String, finish_reason: Option<String>) -> Option<String> {
        encode(&CompletionChunk {
            id: self.id.clone(),
            object: "text_completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                logprobs: None,
                finish_reason,
            }],
        })
    }
}

fn encode<T: Serialize>(chunk: &T) -> Option<String> {
    serde_json::to_string(chunk).ok()
}
