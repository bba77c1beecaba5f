use super::{transport_error, CompletionProvider, CompletionRequest, LlmError, Message};
use serde::{Deserialize, Serialize};

pub struct OllamaClient {
    pub base_url: String,
    client: reqwest::blocking::Client,
}

// --- Ollama API request/response types ---

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
}

// --- Implementation ---

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            // Per-request timeouts come from CompletionRequest.
            client: reqwest::blocking::Client::new(),
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    fn extract_content(body: OllamaChatResponse) -> Result<String, LlmError> {
        body.message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::Malformed("response has no message".to_string()))
    }
}

impl CompletionProvider for OllamaClient {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);

        let body = OllamaChatRequest {
            model: request.model,
            messages: Self::convert_messages(request.messages),
            stream: false,
        };

        tracing::debug!(url = %url, model = request.model, turns = request.messages.len(), "ollama chat");

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .map_err(|e| transport_error(e, &format!("Ollama at {}", self.base_url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                body: if status == reqwest::StatusCode::NOT_FOUND {
                    format!(
                        "model '{}' not found. Pull it with: ollama pull {} ({})",
                        request.model, request.model, body
                    )
                } else {
                    body
                },
            });
        }

        let resp_body: OllamaChatResponse = response.json().map_err(|e| {
            LlmError::Malformed(format!("failed to parse Ollama response: {}", e))
        })?;

        Self::extract_content(resp_body)
    }
}
