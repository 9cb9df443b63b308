//! Deepgram live-transcription backend.
//!
//! Speaks the `/v1/listen` streaming WebSocket protocol: binary frames of
//! PCM up, JSON result/metadata events down, `KeepAlive` text frames to
//! hold the session open.

use crate::error::PipelineError;
use crate::stt::{
    SpeechData, SttAudioSink, SttConnector, SttEventSource, SttOptions, SttSession, SttVendorEvent,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const DEFAULT_ENDPOINT: &str = "wss://api.deepgram.com/v1/listen";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector holding the vendor credentials.
pub struct DeepgramConnector {
    api_key: String,
    endpoint: String,
}

impl DeepgramConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    fn session_url(&self, options: &SttOptions) -> String {
        format!(
            "{}?model={}&language={}&encoding={}&sample_rate={}&channels={}\
             &punctuate={}&smart_format={}&interim_results={}&filler_words={}\
             &vad_events={}&endpointing={}&no_delay={}&profanity_filter={}&dictation={}",
            self.endpoint,
            options.model,
            options.language,
            options.encoding,
            options.sample_rate,
            options.channels,
            options.punctuate,
            options.smart_format,
            options.interim_results,
            options.filler_words,
            options.vad_events,
            options.endpointing_ms,
            options.no_delay,
            options.profanity_filter,
            options.dictation,
        )
    }
}

#[async_trait]
impl SttConnector for DeepgramConnector {
    async fn connect(&self, options: &SttOptions) -> Result<Box<dyn SttSession>, PipelineError> {
        let url = self.session_url(options);
        let mut request = url
            .into_client_request()
            .map_err(|e| PipelineError::Stt(format!("invalid stt endpoint: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key)
                .parse()
                .map_err(|e| PipelineError::Stt(format!("invalid api key header: {e}")))?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| PipelineError::Stt(format!("failed to connect stt session: {e}")))?;

        Ok(Box::new(DeepgramSession {
            ws,
            language: options.language.clone(),
        }))
    }
}

/// One live session; splits into its sending and receiving halves.
pub struct DeepgramSession {
    ws: WsStream,
    language: String,
}

impl SttSession for DeepgramSession {
    fn split(self: Box<Self>) -> (Box<dyn SttAudioSink>, Box<dyn SttEventSource>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(DeepgramSink { sink }),
            Box::new(DeepgramSource {
                stream,
                language: self.language,
                opened: false,
            }),
        )
    }
}

struct DeepgramSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SttAudioSink for DeepgramSink {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), PipelineError> {
        self.sink
            .send(Message::Binary(pcm.to_vec().into()))
            .await
            .map_err(|e| PipelineError::Stt(format!("failed to send audio: {e}")))
    }

    async fn keep_alive(&mut self) -> Result<(), PipelineError> {
        self.sink
            .send(Message::Text(r#"{"type":"KeepAlive"}"#.into()))
            .await
            .map_err(|e| PipelineError::Stt(format!("failed to send keep-alive: {e}")))
    }

    async fn close(&mut self) {
        // Ask the vendor to finish pending transcripts, then close.
        let _ = self
            .sink
            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
            .await;
        let _ = self.sink.close().await;
    }
}

struct DeepgramSource {
    stream: SplitStream<WsStream>,
    language: String,
    opened: bool,
}

#[async_trait]
impl SttEventSource for DeepgramSource {
    async fn recv(&mut self) -> Option<SttVendorEvent> {
        // The protocol has no explicit open event; the first inbound frame
        // confirms the session.
        if !self.opened {
            self.opened = true;
            return Some(SttVendorEvent::Open);
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Some(SttVendorEvent::Error(e.to_string())),
                None => return Some(SttVendorEvent::Closed),
            };

            match message {
                Message::Text(text) => {
                    if let Some(event) = parse_event(&self.language, text.as_str()) {
                        return Some(event);
                    }
                }
                Message::Close(_) => return Some(SttVendorEvent::Closed),
                // Ping/pong are handled by the transport; binary frames are
                // not part of the downstream protocol.
                _ => {}
            }
        }
    }
}

/// Maps one JSON payload; malformed payloads are logged and dropped.
fn parse_event(language: &str, text: &str) -> Option<SttVendorEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("dropping malformed stt payload: {}", e);
            return None;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("Results") => {
            let is_final = value
                .get("is_final")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let speech_final = value
                .get("speech_final")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let alternatives = parse_alternatives(language, &value);
            Some(SttVendorEvent::Transcript {
                is_final,
                speech_final,
                alternatives,
            })
        }
        Some("SpeechStarted") => Some(SttVendorEvent::SpeechStarted),
        Some("Metadata") => {
            tracing::debug!("stt metadata: {}", value);
            None
        }
        Some(other) => {
            tracing::warn!("unhandled stt event type: {}", other);
            None
        }
        None => {
            tracing::warn!("dropping stt payload without type");
            None
        }
    }
}

fn parse_alternatives(language: &str, value: &serde_json::Value) -> Vec<SpeechData> {
    let Some(alternatives) = value
        .pointer("/channel/alternatives")
        .and_then(|a| a.as_array())
    else {
        return Vec::new();
    };

    alternatives
        .iter()
        .map(|alt| {
            let words = alt.get("words").and_then(|w| w.as_array());
            let start_time = words
                .and_then(|w| w.first())
                .and_then(|w| w.get("start"))
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0);
            let end_time = words
                .and_then(|w| w.last())
                .and_then(|w| w.get("end"))
                .and_then(|e| e.as_f64())
                .unwrap_or(0.0);
            SpeechData {
                language: language.to_string(),
                text: alt
                    .get("transcript")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                start_time,
                end_time,
                confidence: alt
                    .get("confidence")
                    .and_then(|c| c.as_f64())
                    .unwrap_or(0.0),
            }
        })
        .collect()
}
