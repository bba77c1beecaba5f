use super::{transport_error, CompletionProvider, CompletionRequest, LlmError, Message};
use serde::{Deserialize, Serialize};

pub struct OpenAiCompatClient {
    pub base_url: String,
    pub api_key: Option<String>,
    client: reqwest::blocking::Client,
}

// --- OpenAI-compatible API request/response types ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessage,
}

// --- Implementation ---

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.to_string(),
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn extract_content(body: ChatResponse) -> Result<String, LlmError> {
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("no choices in response".to_string()))?;
        // A null content is a valid (empty) reply, e.g. after a refusal.
        Ok(choice.message.content.unwrap_or_default())
    }
}

impl CompletionProvider for OpenAiCompatClient {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let body = ChatRequest {
            model: request.model,
            messages: Self::convert_messages(request.messages),
            stream: false,
        };

        tracing::debug!(url = %url, model = request.model, turns = request.messages.len(), "chat completion");

        let mut req_builder = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body);

        if let Some(ref key) = self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = req_builder.send().map_err(|e| {
            transport_error(e, &format!("OpenAI-compatible server at {}", self.base_url))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                body: "authentication failed. Check api_key in config.".to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let resp_body: ChatResponse = response
            .json()
            .map_err(|e| LlmError::Malformed(format!("failed to parse response: {}", e)))?;

        Self::extract_content(resp_body)
    }
}
