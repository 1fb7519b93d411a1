//! Chat model abstraction and the OpenAI chat completions client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::{Config, ConfigError};

/// Errors raised while talking to a chat model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The client could not be configured.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The provider could not be reached.
    #[error("Chat model unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with a non-success status.
    #[error("Chat model returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message reported by the provider.
        message: String,
    },
    /// The provider's answer could not be decoded.
    #[error("Malformed chat completion: {0}")]
    InvalidResponse(String),
}

/// Function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the model.
    #[serde(default)]
    pub arguments: String,
}

/// Tool call attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier echoed back in the matching tool message.
    pub id: String,
    /// Always `function`.
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    /// Requested function and arguments.
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Function call with the given id, name and JSON arguments.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }
}

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    /// Instructions that frame the conversation.
    System {
        /// Prompt text.
        content: String,
    },
    /// The user's message.
    User {
        /// Message text.
        content: String,
    },
    /// A model turn, carrying text, tool calls or both.
    Assistant {
        /// Answer text, absent when the model only calls tools.
        content: Option<String>,
        /// Tools the model asked to run.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// Result of a tool call.
    Tool {
        /// Id of the call this answers.
        tool_call_id: String,
        /// Tool output.
        content: String,
    },
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Tool result message.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// The model's reply to a completion request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantMessage {
    /// Answer text.
    pub content: Option<String>,
    /// Tool calls the model wants answered before it continues.
    pub tool_calls: Vec<ToolCall>,
}

impl From<AssistantMessage> for ChatMessage {
    fn from(message: AssistantMessage) -> Self {
        ChatMessage::Assistant {
            content: message.content,
            tool_calls: message.tool_calls,
        }
    }
}

/// Function tool offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    /// Function name.
    pub name: String,
    /// What the function does, shown to the model.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A chat model that can answer a conversation, optionally calling tools.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier.
    fn id(&self) -> &str;

    /// Produce the next assistant turn for `messages`.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantMessage, ModelError>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIChat {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIChat {
    /// Construct a client for `model` at the given base URL.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let http = Client::builder()
            .user_agent("postrag/chat")
            .build()
            .map_err(|error| ModelError::Unavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Client for the configured chat model; requires `OPENAI_API_KEY`.
    pub fn from_config(config: &Config) -> Result<Self, ModelError> {
        let api_key = config.require_openai_api_key()?;
        Self::new(&config.openai_base_url, api_key, &config.chat_model)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: RawAssistantMessage,
}

#[derive(Debug, Deserialize)]
struct RawAssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantMessage, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolDefinition::to_openai).collect());
        }

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "Requesting chat completion"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                ModelError::Unavailable(format!("failed to reach {}: {error}", self.base_url))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response.json().await.map_err(|error| {
            ModelError::InvalidResponse(format!("failed to decode completion: {error}"))
        })?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ModelError::InvalidResponse("no choices returned".to_string()))?;

        Ok(AssistantMessage {
            content: message.content.filter(|content| !content.is_empty()),
            tool_calls: message.tool_calls.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn search_tool() -> ToolDefinition {
        ToolDefinition {
            name: "search_knowledge_base".into(),
            description: "Search".into(),
            parameters: json!({ "type": "object" }),
        }
    }

    #[test]
    fn messages_serialize_in_openai_shape() {
        let assistant: ChatMessage = AssistantMessage {
            content: None,
            tool_calls: vec![ToolCall::function("call_1", "search_knowledge_base", &json!({ "query": "habit" }))],
        }
        .into();
        assert_eq!(
            serde_json::to_value(&assistant).expect("json"),
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "search_knowledge_base", "arguments": "{\"query\":\"habit\"}" }
                }]
            })
        );
        assert_eq!(
            serde_json::to_value(ChatMessage::tool("call_1", "[]")).expect("json"),
            json!({ "role": "tool", "tool_call_id": "call_1", "content": "[]" })
        );
    }

    #[tokio::test]
    async fn complete_decodes_tool_calls() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer test-key")
                .body_contains("\"tools\"")
                .body_contains("search_knowledge_base");
            then.status(200).json_body(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": { "name": "search_knowledge_base", "arguments": "{\"query\":\"habit\"}" }
                        }]
                    }
                }]
            }));
        });

        let model = OpenAIChat::new(server.base_url(), "test-key", "gpt-4o-mini").expect("client");
        let reply = model
            .complete(&[ChatMessage::user("What was her terrible habit?")], &[search_tool()])
            .await
            .expect("reply");

        mock.assert();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id, "call_9");
        assert_eq!(reply.tool_calls[0].function.name, "search_knowledge_base");
    }

    #[tokio::test]
    async fn complete_returns_content() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Biting her nails." } }]
            }));
        });

        let model = OpenAIChat::new(server.base_url(), "k", "gpt-4o-mini").expect("client");
        let reply = model.complete(&[ChatMessage::user("hi")], &[]).await.expect("reply");
        assert_eq!(reply.content.as_deref(), Some("Biting her nails."));
        assert!(reply.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn api_errors_surface_provider_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401)
                .json_body(json!({ "error": { "message": "Incorrect API key provided" } }));
        });

        let model = OpenAIChat::new(server.base_url(), "bad", "gpt-4o-mini").expect("client");
        let error = model.complete(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        match error {
            ModelError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_choices_are_invalid() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({ "choices": [] }));
        });

        let model = OpenAIChat::new(server.base_url(), "k", "gpt-4o-mini").expect("client");
        let error = model.complete(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(error, ModelError::InvalidResponse(_)));
    }
}
