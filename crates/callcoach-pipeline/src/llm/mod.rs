//! The coaching stage: conversational model with per-call memory.
//!
//! Accumulated speech transcript goes in as the latest turn; the model's
//! token stream comes back split into speakable sentences, each emitted the
//! moment it completes so the first audible advice is not gated on the full
//! generation. `interrupt()` implements barge-in: once set, nothing more is
//! emitted for that turn no matter how much generation continues.

pub mod gemini;

use crate::error::PipelineError;
use crate::queue::StreamingQueue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Queue depth for emitted utterances.
const UTTERANCE_QUEUE_DEPTH: usize = 64;

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn in the per-call conversation thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One speakable unit of generated advice.
#[derive(Debug, Clone, PartialEq)]
pub struct CoachingUtterance {
    pub text: String,
    /// Whether the utterance ended at a sentence boundary (as opposed to
    /// the trailing fragment flushed at stream end).
    pub sentence_boundary: bool,
}

/// Options for the conversational model.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlmOptions {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "gemini-2.0-flash-lite".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

/// Capability interface over a streaming conversational model.
///
/// Returns a channel of text chunks; an `Err` item aborts the turn.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError>;
}

/// A per-call conversational session: fixed persona, the call's configured
/// topic, and one persisted message thread.
pub struct Llm {
    thread_id: String,
    model: Arc<dyn ChatModel>,
    system_prompt: String,
    topic_prompt: String,
    history: Mutex<Vec<ChatMessage>>,
}

impl Llm {
    pub fn new(
        model: Arc<dyn ChatModel>,
        system_prompt: impl Into<String>,
        topic_prompt: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            thread_id: Uuid::new_v4().to_string(),
            model,
            system_prompt: system_prompt.into(),
            topic_prompt: topic_prompt.into(),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Opens the streaming chat interface for this call.
    pub fn chat(self: &Arc<Self>) -> LlmStream {
        LlmStream {
            llm: self.clone(),
            output: StreamingQueue::bounded(UTTERANCE_QUEUE_DEPTH),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A streaming generation interface over one call's session.
#[derive(Clone)]
pub struct LlmStream {
    llm: Arc<Llm>,
    output: StreamingQueue<CoachingUtterance>,
    interrupted: Arc<AtomicBool>,
}

impl LlmStream {
    /// Runs one coaching turn for the accumulated transcript.
    ///
    /// Streams the model, emitting each completed sentence immediately and
    /// flushing any trailing fragment at stream end. Vendor failures are
    /// logged and abort the turn without crashing the stage.
    pub async fn send_chat(&self, user_message: &str) {
        let trimmed = user_message.trim();
        if trimmed.is_empty() {
            return;
        }

        // A new turn clears the previous turn's barge-in.
        self.interrupted.store(false, Ordering::Release);

        let messages = {
            let mut history = self.llm.history.lock().await;
            history.push(ChatMessage::user(trimmed));

            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(ChatMessage::system(format!(
                "{}\n\n{}",
                self.llm.system_prompt, self.llm.topic_prompt
            )));
            messages.extend(history.iter().cloned());
            messages
        };

        let mut chunks = match self.llm.model.stream_chat(messages).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(thread_id = %self.llm.thread_id, "llm request failed: {}", e);
                return;
            }
        };

        let mut buffer = String::new();
        let mut full_response = String::new();

        while let Some(chunk) = chunks.recv().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(thread_id = %self.llm.thread_id, "llm stream failed: {}", e);
                    return;
                }
            };
            full_response.push_str(&chunk);
            buffer.push_str(&chunk);

            while let Some(boundary) = buffer.find('.') {
                let sentence = buffer[..boundary].trim().to_string();
                buffer.drain(..=boundary);
                if sentence.is_empty() {
                    continue;
                }
                if self.interrupted.load(Ordering::Acquire) {
                    return;
                }
                let utterance = CoachingUtterance {
                    text: format!("{sentence}."),
                    sentence_boundary: true,
                };
                if self.output.put(utterance).await.is_err() {
                    return;
                }
            }
        }

        let remainder = buffer.trim();
        if !remainder.is_empty() {
            if self.interrupted.load(Ordering::Acquire) {
                return;
            }
            let utterance = CoachingUtterance {
                text: remainder.to_string(),
                sentence_boundary: false,
            };
            if self.output.put(utterance).await.is_err() {
                return;
            }
        }

        self.llm
            .history
            .lock()
            .await
            .push(ChatMessage::assistant(full_response));
    }

    /// Barge-in: stop emitting for the current turn. Generation may keep
    /// running in the background; its output is discarded.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// The next utterance, or `None` once the stream closes.
    pub async fn next_utterance(&self) -> Option<CoachingUtterance> {
        self.output.get().await
    }

    pub fn close(&self) {
        self.output.close();
    }
}
