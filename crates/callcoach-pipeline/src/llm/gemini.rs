//! Gemini streaming backend for the coaching stage.
//!
//! Calls `models/{model}:streamGenerateContent?alt=sse` and forwards the
//! candidate text of each SSE chunk. The conversation thread maps onto the
//! API's `contents` turns, with the system prompt carried as
//! `systemInstruction`.

use crate::error::PipelineError;
use crate::llm::{ChatMessage, ChatModel, ChatRole, LlmOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// Depth of the chunk channel handed to the coaching stage.
const CHUNK_CHANNEL_DEPTH: usize = 32;

pub struct GeminiChatModel {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    options: LlmOptions,
}

impl GeminiChatModel {
    pub fn new(api_key: impl Into<String>, options: LlmOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            options,
        }
    }

    pub fn with_endpoint(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        options: LlmOptions,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            options,
        }
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let system: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .collect();
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        ChatRole::Assistant => "model",
                        _ => "user",
                    },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {"temperature": self.options.temperature},
        });
        if !system.is_empty() {
            let text = system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            body["systemInstruction"] = json!({"parts": [{"text": text}]});
        }
        body
    }
}

#[async_trait]
impl ChatModel for GeminiChatModel {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.endpoint, self.options.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(&messages))
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("llm request failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Llm(format!("llm request rejected: {e}")))?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut pending = String::new();

            while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(e) => {
                        let _ = tx
                            .send(Err(PipelineError::Llm(format!("llm stream failed: {e}"))))
                            .await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&piece));

                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match extract_text(data.trim()) {
                        Some(text) if !text.is_empty() => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Pulls the candidate text out of one SSE data payload. Malformed
/// payloads are logged and skipped.
fn extract_text(data: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("dropping malformed llm chunk: {}", e);
            return None;
        }
    };

    let parts = value.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
        .collect();
    Some(text)
}
