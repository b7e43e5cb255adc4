//! Translate OpenAI chat and text-completion requests into native Ollama requests.
//!
//! Message content is canonicalized to plain strings, the model name is resolved
//! against the configured default, and only the generation options the caller
//! actually set are carried over.

use super::ollama_types::{OllamaChatRequest, OllamaGenerateRequest, OllamaMessage, OllamaOptions};
use super::openai_types::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, Prompt, StopSequences,
};
use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};

/// Builds backend requests. Holds the only configuration translation needs.
#[derive(Debug, Clone)]
pub struct RequestTranslator {
    default_model: String,
}

impl RequestTranslator {
    pub fn new(backend: &BackendConfig) -> Self {
        Self {
            default_model: backend.default_model.clone(),
        }
    }

    /// The requested model, or the configured default when the request left it empty.
    pub fn resolve_model(&self, requested: &str) -> String {
        if requested.is_empty() {
            self.default_model.clone()
        } else {
            requested.to_string()
        }
    }

    pub fn chat(&self, req: &ChatCompletionRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.resolve_model(&req.model),
            messages: req.messages.iter().map(canonical_message).collect(),
            stream,
            options: map_options(GenerationParams {
                temperature: req.temperature,
                top_p: req.top_p,
                max_tokens: req.max_tokens,
                stop: req.stop.as_ref(),
                presence_penalty: req.presence_penalty,
                frequency_penalty: req.frequency_penalty,
            }),
        }
    }

    /// Fails only when the prompt is neither a string nor a list of strings.
    pub fn completion(&self, req: &CompletionRequest, stream: bool) -> Result<OllamaGenerateRequest> {
        let prompt = match req.prompt.as_ref() {
            Some(prompt) => prompt_text(prompt)?,
            None => String::new(),
        };

        Ok(OllamaGenerateRequest {
            model: self.resolve_model(&req.model),
            prompt,
            stream,
            options: map_options(GenerationParams {
                temperature: req.temperature,
                top_p: req.top_p,
                max_tokens: req.max_tokens,
                stop: req.stop.as_ref(),
                presence_penalty: req.presence_penalty,
                frequency_penalty: req.frequency_penalty,
            }),
        })
    }
}

/// The option fields chat and completion requests share.
struct GenerationParams<'a> {
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<i64>,
    stop: Option<&'a StopSequences>,
    presence_penalty: Option<f64>,
    frequency_penalty: Option<f64>,
}

fn map_options(params: GenerationParams<'_>) -> Option<OllamaOptions> {
    let options = OllamaOptions {
        temperature: params.temperature,
        top_p: params.top_p,
        num_predict: params.max_tokens,
        stop: params.stop.and_then(StopSequences::normalize),
        presence_penalty: params.presence_penalty,
        frequency_penalty: params.frequency_penalty,
    };

    if options.is_empty() {
        None
    } else {
        Some(options)
    }
}

fn canonical_message(msg: &ChatMessage) -> OllamaMessage {
    OllamaMessage {
        role: msg.role.clone(),
        content: msg.content.canonicalize(),
        name: msg.name.clone(),
    }
}

/// Flatten a text-completion prompt. Lists are joined one entry per line.
pub fn prompt_text(prompt: &Prompt) -> Result<String> {
    match prompt {
        Prompt::Text(text) => Ok(text.clone()),
        Prompt::Lines(lines) => Ok(lines.join("\n")),
        Prompt::Other(_) => Err(ProxyError::translation(
            "Prompt must be a string or an array of strings",
        )),
    }
}

/// The prompt text usage accounting is computed from: one `role: content` line per message.
pub fn format_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}\n", m.role, m.content.canonicalize()))
        .collect()
}
