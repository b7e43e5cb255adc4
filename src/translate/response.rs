use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use super::ollama_types::{OllamaChatResponse, OllamaGenerateResponse};
use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, ChoiceMessage, CompletionChoice,
    CompletionRequest, CompletionResponse, Usage,
};
use super::request::format_messages;

pub const FINISH_STOP: &str = "stop";

static LAST_ID_NANOS: AtomicI64 = AtomicI64::new(0);

/// Process-unique id of the form `{prefix}-{nanos}`.
///
/// The suffix is the current nanosecond timestamp, bumped past the last issued
/// value when two calls land on the same (or an earlier) instant.
pub fn next_id(prefix: &str) -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let prev = LAST_ID_NANOS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    format!("{prefix}-{}", now.max(prev + 1))
}

/// Approximate token count: one token per four bytes, rounded down.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

fn usage(prompt: &str, completion: &str) -> Usage {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens = estimate_tokens(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

/// Translate an Ollama chat response into an OpenAI chat completion.
/// The model echoed back is the one the caller asked for.
pub fn ollama_chat_to_openai(
    resp: &OllamaChatResponse,
    req: &ChatCompletionRequest,
) -> ChatCompletionResponse {
    let content = resp.message.content.clone();
    let role = if resp.message.role.is_empty() {
        "assistant".to_string()
    } else {
        resp.message.role.clone()
    };

    ChatCompletionResponse {
        id: next_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: req.model.clone(),
        usage: usage(&format_messages(&req.messages), &content),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage { role, content },
            finish_reason: FINISH_STOP.to_string(),
        }],
    }
}

/// Translate an Ollama generate response into an OpenAI text completion.
/// `prompt` is the flattened prompt that was sent.
pub fn ollama_generate_to_openai(
    resp: &OllamaGenerateResponse,
    req: &CompletionRequest,
    prompt: &str,
) -> CompletionResponse {
    CompletionResponse {
        id: next_id("cmpl"),
        object: "text_completion".to_string(),
        created: Utc::now().timestamp(),
        model: req.model.clone(),
        usage: usage(prompt, &resp.response),
        choices: vec![CompletionChoice {
            text: resp.response.clone(),
            index: 0,
            logprobs: None,
            finish_reason: Some(FINISH_STOP.to_string()),
        }],
    }
}
