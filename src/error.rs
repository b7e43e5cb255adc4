//! Error types for the proxy.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The Ollama call failed: connect error, non-success status, or an
    /// undecodable body. Never shown to API callers verbatim.
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// The inbound request has a shape that cannot be forwarded.
    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchange log file could not be opened.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    /// Whether the failure was caused by the caller's request rather than the backend.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Translation { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
