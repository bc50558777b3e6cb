//! LLM client interface: fallback field parsing and the chat tool loop.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("llm response decode error: {0}")]
    Decode(String),
}

/// Structured output of the fallback confirmation parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmFields {
    #[serde(default)]
    pub supplier_order_number: Option<String>,
    #[serde(default)]
    pub confirmed_delivery_date: Option<String>,
    #[serde(default)]
    pub confirmed_quantity: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// One turn in a chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: "tool".into(), content: content.into() }
    }
}

/// Tool exposed to the chat loop.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// Tool call requested by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: JsonValue,
}

/// One model step: free text and/or tool calls. No tool calls terminates the
/// loop.
#[derive(Debug, Clone, Default)]
pub struct ChatStep {
    pub reply: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

#[rocket::async_trait]
pub trait LlmClient: Send + Sync {
    /// Parse confirmation fields from document text. Confidence from this
    /// path is capped by the caller.
    async fn parse_confirmation(
        &self,
        text: &str,
        expected_qty: Option<f64>,
    ) -> Result<Option<LlmFields>, LlmError>;

    /// One step of the interactive tool-calling loop.
    async fn chat_step(
        &self,
        system: &str,
        transcript: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatStep, LlmError>;
}

/// HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl HttpLlmClient {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let api_key = config.llm_api_key.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            api_key,
            api_base: config.llm_api_base.clone(),
            model: config.llm_model.clone(),
        })
    }

    async fn completions(&self, payload: JsonValue) -> Result<JsonValue, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }
        Ok(response.json().await?)
    }
}

const PARSE_SYSTEM_PROMPT: &str = "You extract purchase-order confirmation fields from supplier \
documents. Respond with a single JSON object with keys supplier_order_number (string or null), \
confirmed_delivery_date (ISO date or null), confirmed_quantity (number or null), and confidence \
(0-1). Use null when a field is absent. Never invent values.";

#[rocket::async_trait]
impl LlmClient for HttpLlmClient {
    async fn parse_confirmation(
        &self,
        text: &str,
        expected_qty: Option<f64>,
    ) -> Result<Option<LlmFields>, LlmError> {
        let hint = expected_qty
            .map(|qty| format!("\n\nThe buyer ordered a quantity of {qty}."))
            .unwrap_or_default();

        let body = self
            .completions(json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": PARSE_SYSTEM_PROMPT },
                    { "role": "user", "content": format!("{text}{hint}") },
                ],
                "response_format": { "type": "json_object" },
            }))
            .await?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Decode("missing message content".into()))?;

        let fields: LlmFields = serde_json::from_str(content)
            .map_err(|err| LlmError::Decode(format!("bad field JSON: {err}")))?;
        Ok(Some(fields))
    }

    async fn chat_step(
        &self,
        system: &str,
        transcript: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatStep, LlmError> {
        let mut messages = vec![json!({ "role": "system", "content": system })];
        for message in transcript {
            messages.push(json!({ "role": message.role, "content": message.content }));
        }

        let tool_defs: Vec<JsonValue> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();

        let body = self
            .completions(json!({
                "model": self.model,
                "messages": messages,
                "tools": tool_defs,
            }))
            .await?;

        let message = &body["choices"][0]["message"];
        let reply = message["content"].as_str().map(str::to_string);

        let mut tool_calls = Vec::new();
        if let Some(raw_calls) = message["tool_calls"].as_array() {
            for call in raw_calls {
                let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
                if name.is_empty() {
                    continue;
                }
                let arguments = call["function"]["arguments"]
                    .as_str()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or(JsonValue::Null);
                tool_calls.push(ToolInvocation { name, arguments });
            }
        }

        Ok(ChatStep { reply, tool_calls })
    }
}
