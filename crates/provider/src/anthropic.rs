//! Anthropic Messages API client.
//!
//! Speaks the native Messages API:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE; each `data:` payload deserializes into a typed
//!   [`StreamEvent`] forwarded to the caller as-is
//!
//! The client does no aggregation — reducing the event stream into content
//! blocks is the stream aggregator's job.

use async_trait::async_trait;
use futures::StreamExt;
use mealmind_core::error::ProviderError;
use mealmind_core::message::Message;
use mealmind_core::provider::{CompletionProvider, CompletionRequest, StreamEvent};
use tracing::{debug, trace};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new provider with the given credential.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::Network(format!("HTTP client init: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Use a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert history into wire messages. `MessageContent` already matches
    /// the wire content shape, so the payload serializes directly.
    fn to_wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                })
            })
            .collect()
    }

    fn build_body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_wire_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
        }

        body
    }

    fn status_error(status: u16, body: String) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited { retry_after_secs: 5 },
            401 | 403 => ProviderError::AuthenticationFailed("Invalid Anthropic API key".into()),
            _ => ProviderError::Api { status_code: status, message: body },
        }
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
        ProviderError,
    > {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::build_body(&request);

        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, error_body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    // SSE comments and `event:` lines carry no payload;
                    // the data JSON itself is typed via its `type` field
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }

                    let event: StreamEvent = match serde_json::from_str(data) {
                        Ok(e) => e,
                        Err(e) => {
                            trace!(error = %e, data = %data, "Ignoring unparseable SSE payload");
                            continue;
                        }
                    };

                    match event {
                        StreamEvent::Error { error } => {
                            let _ = tx
                                .send(Err(ProviderError::Stream(format!(
                                    "{}: {}",
                                    error.error_type, error.message
                                ))))
                                .await;
                            return;
                        }
                        StreamEvent::MessageStop => {
                            let _ = tx.send(Ok(StreamEvent::MessageStop)).await;
                            return;
                        }
                        other => {
                            if tx.send(Ok(other)).await.is_err() {
                                // Consumer went away; stop reading
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
