use chrono::Utc;

use super::ollama_types::OllamaTagsResponse;
use super::openai_types::{Model, ModelList};

pub const OWNED_BY: &str = "ollama";

/// Map Ollama's installed models onto the OpenAI `/v1/models` listing.
///
/// Ollama only reports a modification time, so `created` is the time of the listing.
pub fn tags_to_openai(tags: &OllamaTagsResponse) -> ModelList {
    let created = Utc::now().timestamp();

    ModelList {
        object: "list".to_string(),
        data: tags
            .models
            .iter()
            .map(|m| Model {
                id: m.name.clone(),
                object: "model".to_string(),
                created,
                owned_by: OWNED_BY.to_string(),
            })
            .collect(),
    }
}
