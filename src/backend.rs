//! Language-model backend boundary
//!
//! The backend is a black-box completion/tool-use service: it receives the
//! augmented prompt (input + retrieved context + tool schemas) and answers
//! with either natural-language text or a structured tool-use request. All
//! failure modes surface as typed `BackendError`s; nothing opaque crosses
//! this boundary. The default implementation speaks the Anthropic messages
//! wire format.

use crate::config::BackendSection;
use crate::error::{BackendError, NimbusError, Result};
use crate::types::{ToolCall, ToolOutcome};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Tool description advertised to the backend
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation as the backend phrased it, before dispatcher validation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseRequest {
    pub name: String,
    pub input: Value,
}

/// Outcome of a dispatched call, handed back for the final summary
#[derive(Debug, Clone)]
pub struct ToolResultContext {
    pub call: ToolCall,
    pub request: ToolUseRequest,
    pub outcome: ToolOutcome,
}

/// One backend invocation: prompt, retrieved context, available tools,
/// and optionally the outcome of the tool call the backend asked for
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub system: String,
    pub input: String,
    pub context: Vec<String>,
    pub tools: Vec<ToolSchema>,
    pub tool_result: Option<ToolResultContext>,
}

/// Backend answer: text, or a request to run one tool
#[derive(Debug, Clone)]
pub enum BackendResponse {
    Text(String),
    ToolUse(ToolUseRequest),
}

/// Language-model backend boundary trait
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn complete(&self, request: &BackendRequest)
        -> std::result::Result<BackendResponse, BackendError>;
}

/// Stand-in backend for sessions with no model configured.
///
/// Shell and control routes work without a backend; agent-route turns
/// resolve as failed with an explanation instead of hanging or panicking.
pub struct OfflineBackend;

#[async_trait]
impl AgentBackend for OfflineBackend {
    async fn complete(
        &self,
        _request: &BackendRequest,
    ) -> std::result::Result<BackendResponse, BackendError> {
        Err(BackendError::Transport(
            "no language-model backend configured (set the backend API key)".to_string(),
        ))
    }
}

/// Anthropic-style messages client
pub struct HttpBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSchema>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[allow(dead_code)]
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

impl HttpBackend {
    /// Create a backend client from the [backend] config section
    pub fn from_config(section: &BackendSection) -> Result<Self> {
        let api_key = section.api_key().ok_or_else(|| {
            NimbusError::Config(config::ConfigError::Message(format!(
                "backend API key not set ({})",
                section.api_key_env
            )))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(section.timeout_ms))
            .build()
            .map_err(|e| NimbusError::Other(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: section.base_url.clone(),
            model: section.model.clone(),
            max_tokens: section.max_tokens,
            temperature: section.temperature,
            timeout_ms: section.timeout_ms,
        })
    }

    /// Render the augmented request into wire messages.
    ///
    /// Retrieved context is prepended to the user turn; a pending tool
    /// outcome is replayed as the assistant's tool_use plus a tool_result so
    /// the backend can produce its final summary.
    fn build_messages(request: &BackendRequest) -> Vec<Message> {
        let mut user_text = String::new();
        if !request.context.is_empty() {
            user_text.push_str("Relevant context from memory:\n");
            for entry in &request.context {
                user_text.push_str("- ");
                user_text.push_str(entry);
                user_text.push('\n');
            }
            user_text.push('\n');
        }
        user_text.push_str(&request.input);

        let mut messages = vec![Message {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: user_text }],
        }];

        if let Some(result) = &request.tool_result {
            let tool_use_id = format!("toolu_{}", Uuid::new_v4().simple());
            messages.push(Message {
                role: "assistant".to_string(),
                content: vec![ContentBlock::ToolUse {
                    id: tool_use_id.clone(),
                    name: result.request.name.clone(),
                    input: result.request.input.clone(),
                }],
            });
            let content = serde_json::to_string(&result.outcome).unwrap_or_default();
            messages.push(Message {
                role: "user".to_string(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                }],
            });
        }

        messages
    }

    fn parse_response(body: ApiResponse) -> std::result::Result<BackendResponse, BackendError> {
        // A tool_use block wins over text: the backend is asking for work
        for block in &body.content {
            if let ResponseBlock::ToolUse { name, input, .. } = block {
                return Ok(BackendResponse::ToolUse(ToolUseRequest {
                    name: name.clone(),
                    input: input.clone(),
                }));
            }
        }

        let text: String = body
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Err(BackendError::Malformed(
                "response carried neither text nor tool_use".to_string(),
            ));
        }
        Ok(BackendResponse::Text(text))
    }
}

#[async_trait]
impl AgentBackend for HttpBackend {
    async fn complete(
        &self,
        request: &BackendRequest,
    ) -> std::result::Result<BackendResponse, BackendError> {
        debug!("Calling backend model {}", self.model);

        let api_request = ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: request.system.clone(),
            messages: Self::build_messages(request),
            tools: request.tools.clone(),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout_ms)
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(BackendError::RateLimited("429".to_string()));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(BackendError::Transport(format!("{}: {}", status, body)));
            }
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        Self::parse_response(body)
    }
}
