//! API translation between the OpenAI wire format and the native Ollama API.
//!
//! The core of the proxy: converts requests, responses, and streaming chunks
//! between the two formats. All translation functions are pure (no I/O).

pub mod models;
pub mod ollama_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
