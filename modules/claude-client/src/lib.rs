//! Thin Anthropic Messages API client for the enrichment pipeline.
//!
//! Structured extraction forces a tool call whose input schema is derived
//! from the target type via schemars, so the reply is JSON shaped like `T`.
//! A single corrective re-ask is attempted when the reply fails to
//! deserialize; after that the call errors and the caller decides what to
//! degrade.

mod types;

use std::time::Duration;

use anyhow::{anyhow, Result};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use types::*;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Token counts reported by the API for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(&self, request: &ChatRequest) -> Result<ChatResponse> {
        debug!(model = %request.model, "Claude messages request");

        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Claude API error ({status}): {body}"));
        }
        Ok(response.json().await?)
    }

    fn extract_request<T: JsonSchema>(&self, system: &str) -> ChatRequest {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .expect("schema serialization is infallible");

        let mut request = ChatRequest::new(&self.model)
            .system(system)
            .tool(ToolDefinitionWire {
                name: "structured_response".to_string(),
                description: "Extract structured data from the input.".to_string(),
                input_schema: schema,
            });
        request.tool_choice = Some(serde_json::json!({
            "type": "tool",
            "name": "structured_response",
        }));
        request.temperature = Some(0.0);
        request
    }

    /// Extract a `T` from the user prompt, returning it with token usage.
    ///
    /// On a malformed reply the call is re-asked once with the parse error
    /// appended; usage from both attempts is summed.
    pub async fn extract<T: JsonSchema + DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
    ) -> Result<(T, TokenUsage)> {
        let request = self
            .extract_request::<T>(system)
            .message(WireMessage::user(user));

        let response = self.post(&request).await?;
        let mut usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        };

        match Self::parse_tool_input::<T>(&response) {
            Ok(value) => Ok((value, usage)),
            Err(parse_err) => {
                warn!(error = %parse_err, "Malformed structured output, re-asking once");
                let corrective = format!(
                    "{user}\n\nYour previous reply did not match the required schema \
                     ({parse_err}). Reply again with valid data for every required field."
                );
                let retry = self
                    .extract_request::<T>(system)
                    .message(WireMessage::user(corrective));
                let response = self.post(&retry).await?;
                usage.input_tokens += response.usage.input_tokens;
                usage.output_tokens += response.usage.output_tokens;
                let value = Self::parse_tool_input::<T>(&response)?;
                Ok((value, usage))
            }
        }
    }

    fn parse_tool_input<T: DeserializeOwned>(response: &ChatResponse) -> Result<T> {
        for block in &response.content {
            if let ContentBlock::ToolUse { input, .. } = block {
                return serde_json::from_value(input.clone())
                    .map_err(|e| anyhow!("Failed to deserialize response: {e}"));
            }
        }
        // Some replies come back as fenced JSON text instead of a tool call.
        if let Some(text) = response.text() {
            let stripped = strip_code_fences(&text);
            return serde_json::from_str(stripped)
                .map_err(|e| anyhow!("No tool call and text was not valid JSON: {e}"));
        }
        Err(anyhow!("No structured output in Claude response"))
    }

    /// Ask a question about an image by URL. Used for color detection.
    pub async fn describe_image(
        &self,
        image_url: &str,
        instruction: &str,
    ) -> Result<(String, TokenUsage)> {
        let request = ChatRequest::new(&self.model)
            .system(instruction)
            .message(WireMessage::user_blocks(vec![
                ContentBlock::Image {
                    source: ImageSource::Url {
                        url: image_url.to_string(),
                    },
                },
                ContentBlock::Text {
                    text: "Answer for this product image.".to_string(),
                },
            ]));

        let response = self.post(&request).await?;
        let usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        };
        let text = response
            .text()
            .ok_or_else(|| anyhow!("No text in Claude vision response"))?;
        Ok((text, usage))
    }
}

fn strip_code_fences(reply: &str) -> &str {
    let body = reply.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
