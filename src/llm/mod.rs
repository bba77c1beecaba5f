pub mod ollama;
pub mod openai_compat;

use crate::config::LlmConfig;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl Message {
    pub fn system(content: &str) -> Self {
        Self {
            role: Role::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
        }
    }
}

/// One round trip to a completion provider.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure: connection refused, DNS, timeout.
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    /// The provider answered with a non-success status.
    #[error("provider rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The provider answered 2xx but the payload was not usable.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// A chat-completion service. Both HTTP bindings sit behind this.
pub trait CompletionProvider {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError>;
}

/// Map a reqwest transport error the same way for every binding.
pub(crate) fn transport_error(e: reqwest::Error, target: &str) -> LlmError {
    if e.is_connect() {
        LlmError::Unreachable(format!("cannot connect to {}. Is it running?", target))
    } else if e.is_timeout() {
        LlmError::Unreachable(format!("request to {} timed out", target))
    } else {
        LlmError::Unreachable(e.to_string())
    }
}

/// Pick the binding for a configuration. Unknown provider names fall back
/// to Ollama.
pub fn create_provider(cfg: &LlmConfig) -> Box<dyn CompletionProvider> {
    match cfg.provider.as_str() {
        "openai_compat" => Box::new(openai_compat::OpenAiCompatClient::new(
            &cfg.base_url,
            cfg.api_key.clone(),
        )),
        _ => Box::new(ollama::OllamaClient::new(&cfg.base_url)),
    }
}
