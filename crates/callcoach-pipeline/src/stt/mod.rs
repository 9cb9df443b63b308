//! Live speech-to-text: vendor session wrapping and event mapping.
//!
//! The stage runs two loops for the session's lifetime: an audio-sending
//! loop that re-frames input, applies the energy gate, and forwards
//! accepted frames to the vendor (plus a periodic keep-alive), and an
//! event-listening loop that maps vendor events onto the canonical
//! [`SpeechEvent`] taxonomy. Vendors sit behind the [`SttConnector`] /
//! [`SttSession`] capability interfaces so the pipeline never depends on a
//! concrete backend.

pub mod deepgram;

use crate::byte_stream::AudioByteStream;
use crate::energy::AudioEnergyFilter;
use crate::error::PipelineError;
use crate::frame::AudioFrame;
use crate::queue::StreamingQueue;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Queue depth between pipeline stages.
const STT_QUEUE_DEPTH: usize = 64;

/// Options for a live transcription session.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SttOptions {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_true")]
    pub punctuate: bool,
    #[serde(default = "default_true")]
    pub smart_format: bool,
    #[serde(default = "default_true")]
    pub interim_results: bool,
    #[serde(default = "default_true")]
    pub filler_words: bool,
    #[serde(default = "default_true")]
    pub vad_events: bool,
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default = "default_true")]
    pub profanity_filter: bool,
    #[serde(default = "default_true")]
    pub dictation: bool,
    /// Seconds between keep-alive messages while connected.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_model() -> String {
    "nova-3".to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_encoding() -> String {
    "linear16".to_string()
}
fn default_sample_rate() -> u32 {
    48000
}
fn default_channels() -> u16 {
    2
}
fn default_true() -> bool {
    true
}
fn default_endpointing_ms() -> u32 {
    25
}
fn default_keep_alive_secs() -> u64 {
    3
}

impl Default for SttOptions {
    fn default() -> Self {
        Self {
            model: default_model(),
            language: default_language(),
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            punctuate: true,
            smart_format: true,
            interim_results: true,
            filler_words: true,
            vad_events: true,
            endpointing_ms: default_endpointing_ms(),
            no_delay: true,
            profanity_filter: true,
            dictation: true,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// One transcription alternative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechData {
    pub language: String,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
}

/// Canonical transcription lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Connected,
    /// At most one per utterance.
    SpeechStarted,
    InterimTranscript { alternatives: Vec<SpeechData> },
    FinalTranscript { alternatives: Vec<SpeechData> },
    /// Emitted once per utterance when the vendor signals an endpoint
    /// while speech is active.
    EndOfSpeech,
    Disconnected,
}

/// Raw events from a vendor session, before canonical mapping.
#[derive(Debug, Clone)]
pub enum SttVendorEvent {
    Open,
    Transcript {
        is_final: bool,
        speech_final: bool,
        alternatives: Vec<SpeechData>,
    },
    SpeechStarted,
    Error(String),
    Closed,
}

/// Input to the audio-sending loop.
pub enum AudioInput {
    Frame(AudioFrame),
    /// Synthetic marker translated into a final partial-frame flush.
    Flush,
}

/// The sending half of a vendor session.
#[async_trait]
pub trait SttAudioSink: Send {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), PipelineError>;
    async fn keep_alive(&mut self) -> Result<(), PipelineError>;
    async fn close(&mut self);
}

/// The receiving half of a vendor session.
#[async_trait]
pub trait SttEventSource: Send {
    /// The next vendor event; `None` once the session is gone.
    async fn recv(&mut self) -> Option<SttVendorEvent>;
}

/// A live vendor session, splittable into its two halves.
pub trait SttSession: Send {
    fn split(self: Box<Self>) -> (Box<dyn SttAudioSink>, Box<dyn SttEventSource>);
}

/// Establishes vendor sessions.
#[async_trait]
pub trait SttConnector: Send + Sync {
    async fn connect(&self, options: &SttOptions) -> Result<Box<dyn SttSession>, PipelineError>;
}

/// A running transcription stage.
pub struct SttStream {
    input: StreamingQueue<AudioInput>,
    output: StreamingQueue<SpeechEvent>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SttStream {
    /// Starts the audio-sending and event-listening loops over a session.
    pub fn start(session: Box<dyn SttSession>, options: SttOptions) -> Arc<Self> {
        let input: StreamingQueue<AudioInput> = StreamingQueue::bounded(STT_QUEUE_DEPTH);
        let output: StreamingQueue<SpeechEvent> = StreamingQueue::bounded(STT_QUEUE_DEPTH);

        let (sink, source) = session.split();
        let audio_task = tokio::spawn(run_audio_loop(sink, options.clone(), input.clone()));
        let event_task = tokio::spawn(run_event_loop(source, output.clone()));

        Arc::new(Self {
            input,
            output,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![audio_task, event_task]),
        })
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::StreamClosed);
        }
        if self.input.is_closed() {
            return Err(PipelineError::QueueClosed);
        }
        Ok(())
    }

    /// Queues one audio frame for the vendor.
    pub async fn push(&self, frame: AudioFrame) -> Result<(), PipelineError> {
        self.ensure_open()?;
        self.input.put(AudioInput::Frame(frame)).await
    }

    /// Requests a final partial-frame flush.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        self.ensure_open()?;
        self.input.put(AudioInput::Flush).await
    }

    /// Signals that no more audio will arrive; the session closes
    /// gracefully after the buffered input drains.
    pub fn end_input(&self) {
        self.input.close();
    }

    /// The next canonical speech event, or `None` once the stage ends.
    pub async fn next_event(&self) -> Option<SpeechEvent> {
        self.output.get().await
    }

    /// Tears the stage down: closes both queues and stops both loops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.input.close();
        self.output.close();
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
    }
}

/// Reads framed audio from the input queue and forwards what the energy
/// gate accepts; sends a keep-alive heartbeat while the session lives.
async fn run_audio_loop(
    mut sink: Box<dyn SttAudioSink>,
    options: SttOptions,
    input: StreamingQueue<AudioInput>,
) {
    // Vendor-sized frames; the divisor matches the vendor's preferred
    // packet cadence rather than the 20 ms capture framing.
    let samples = (options.sample_rate / 32) as usize;
    let mut byte_stream = AudioByteStream::new(options.sample_rate, options.channels, Some(samples));
    let mut gate = AudioEnergyFilter::default();

    let period = Duration::from_secs(options.keep_alive_secs.max(1));
    let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            item = input.get() => {
                let frames = match item {
                    Some(AudioInput::Frame(frame)) => byte_stream.write(&frame.to_le_bytes()),
                    Some(AudioInput::Flush) => byte_stream.flush(),
                    None => break,
                };
                for frame in frames {
                    if !gate.push_frame(&frame) {
                        continue;
                    }
                    if let Err(e) = sink.send_audio(&frame.to_le_bytes()).await {
                        tracing::warn!("stt audio send failed, tearing down session: {}", e);
                        sink.close().await;
                        return;
                    }
                }
            }
            _ = keep_alive.tick() => {
                if let Err(e) = sink.keep_alive().await {
                    tracing::debug!("stt keep-alive failed: {}", e);
                }
            }
        }
    }

    sink.close().await;
}

/// Maps vendor events onto the canonical taxonomy.
async fn run_event_loop(mut source: Box<dyn SttEventSource>, output: StreamingQueue<SpeechEvent>) {
    let mut speaking = false;

    loop {
        let event = match source.recv().await {
            Some(event) => event,
            None => break,
        };

        match event {
            SttVendorEvent::Open => {
                if output.put(SpeechEvent::Connected).await.is_err() {
                    return;
                }
            }
            SttVendorEvent::Transcript {
                is_final,
                speech_final,
                alternatives,
            } => {
                let has_text = alternatives
                    .first()
                    .map(|alt| !alt.text.is_empty())
                    .unwrap_or(false);
                if !has_text {
                    continue;
                }

                if !speaking {
                    speaking = true;
                    if output.put(SpeechEvent::SpeechStarted).await.is_err() {
                        return;
                    }
                }

                let event = if is_final {
                    SpeechEvent::FinalTranscript { alternatives }
                } else {
                    SpeechEvent::InterimTranscript { alternatives }
                };
                if output.put(event).await.is_err() {
                    return;
                }

                if speech_final && speaking {
                    speaking = false;
                    if output.put(SpeechEvent::EndOfSpeech).await.is_err() {
                        return;
                    }
                }
            }
            SttVendorEvent::SpeechStarted => {
                if !speaking {
                    speaking = true;
                    if output.put(SpeechEvent::SpeechStarted).await.is_err() {
                        return;
                    }
                }
            }
            SttVendorEvent::Error(message) => {
                tracing::warn!("stt vendor error, tearing down session: {}", message);
                let _ = output.put(SpeechEvent::Disconnected).await;
                output.close();
                return;
            }
            SttVendorEvent::Closed => break,
        }
    }

    let _ = output.put(SpeechEvent::Disconnected).await;
    output.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Scripted vendor session: the sink records audio, the source replays
    /// scripted events and reports closure when the sink closes.
    struct FakeSession {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        script: Vec<SttVendorEvent>,
    }

    struct FakeSink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed_tx: mpsc::UnboundedSender<SttVendorEvent>,
    }

    struct FakeSource {
        rx: mpsc::UnboundedReceiver<SttVendorEvent>,
    }

    impl SttSession for FakeSession {
        fn split(self: Box<Self>) -> (Box<dyn SttAudioSink>, Box<dyn SttEventSource>) {
            let (tx, rx) = mpsc::unbounded_channel();
            for event in self.script {
                let _ = tx.send(event);
            }
            (
                Box::new(FakeSink {
                    sent: self.sent,
                    closed_tx: tx,
                }),
                Box::new(FakeSource { rx }),
            )
        }
    }

    #[async_trait]
    impl SttAudioSink for FakeSink {
        async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), PipelineError> {
            self.sent.lock().unwrap().push(pcm.to_vec());
            Ok(())
        }

        async fn keep_alive(&mut self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn close(&mut self) {
            let _ = self.closed_tx.send(SttVendorEvent::Closed);
        }
    }

    #[async_trait]
    impl SttEventSource for FakeSource {
        async fn recv(&mut self) -> Option<SttVendorEvent> {
            self.rx.recv().await
        }
    }

    fn alternatives(text: &str) -> Vec<SpeechData> {
        vec![SpeechData {
            language: "en-US".to_string(),
            text: text.to_string(),
            start_time: 0.0,
            end_time: 1.0,
            confidence: 0.9,
        }]
    }

    fn stream_with_script(script: Vec<SttVendorEvent>) -> (Arc<SttStream>, Arc<Mutex<Vec<Vec<u8>>>>)
    {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let session = Box::new(FakeSession {
            sent: sent.clone(),
            script,
        });
        let options = SttOptions {
            sample_rate: 16000,
            channels: 1,
            ..SttOptions::default()
        };
        (SttStream::start(session, options), sent)
    }

    #[tokio::test]
    async fn vendor_events_map_to_canonical_taxonomy() {
        let (stream, _) = stream_with_script(vec![
            SttVendorEvent::Open,
            SttVendorEvent::Transcript {
                is_final: false,
                speech_final: false,
                alternatives: alternatives("hel"),
            },
            SttVendorEvent::SpeechStarted, // suppressed: already speaking
            SttVendorEvent::Transcript {
                is_final: true,
                speech_final: true,
                alternatives: alternatives("hello"),
            },
            SttVendorEvent::Closed,
        ]);

        assert_eq!(stream.next_event().await, Some(SpeechEvent::Connected));
        assert_eq!(stream.next_event().await, Some(SpeechEvent::SpeechStarted));
        assert!(matches!(
            stream.next_event().await,
            Some(SpeechEvent::InterimTranscript { .. })
        ));
        assert!(matches!(
            stream.next_event().await,
            Some(SpeechEvent::FinalTranscript { .. })
        ));
        assert_eq!(stream.next_event().await, Some(SpeechEvent::EndOfSpeech));
        assert_eq!(stream.next_event().await, Some(SpeechEvent::Disconnected));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn empty_transcripts_are_dropped() {
        let (stream, _) = stream_with_script(vec![
            SttVendorEvent::Open,
            SttVendorEvent::Transcript {
                is_final: true,
                speech_final: true,
                alternatives: alternatives(""),
            },
            SttVendorEvent::Closed,
        ]);

        assert_eq!(stream.next_event().await, Some(SpeechEvent::Connected));
        // No SpeechStarted/Final/EndOfSpeech for empty text.
        assert_eq!(stream.next_event().await, Some(SpeechEvent::Disconnected));
    }

    #[tokio::test]
    async fn vendor_error_tears_the_session_down() {
        let (stream, _) = stream_with_script(vec![
            SttVendorEvent::Open,
            SttVendorEvent::Error("boom".to_string()),
        ]);

        assert_eq!(stream.next_event().await, Some(SpeechEvent::Connected));
        assert_eq!(stream.next_event().await, Some(SpeechEvent::Disconnected));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn audio_loop_forwards_gated_frames_only() {
        let (stream, sent) = stream_with_script(vec![SttVendorEvent::Open]);

        // 16000 / 32 = 500 samples per vendor frame; two loud vendor frames.
        let loud = AudioFrame::new(vec![3000i16; 1000], 16000, 1);
        stream.push(loud).await.unwrap();

        // Sustained silence: passes only during the 1 s cooldown, then is
        // suppressed. 64 frames × 31.25 ms ≈ 2 s of silence.
        for _ in 0..64 {
            let silent = AudioFrame::new(vec![0i16; 500], 16000, 1);
            stream.push(silent).await.unwrap();
        }
        stream.end_input();

        // The session closes after the input drains.
        loop {
            match stream.next_event().await {
                Some(SpeechEvent::Disconnected) | None => break,
                Some(_) => {}
            }
        }

        let sent = sent.lock().unwrap();
        let loud_frames = 2;
        let cooldown_frames = 32; // 1 s at 31.25 ms per frame
        assert!(sent.len() >= loud_frames, "loud frames must be forwarded");
        assert!(
            sent.len() <= loud_frames + cooldown_frames + 1,
            "suppressed silence must not be forwarded (sent {})",
            sent.len()
        );
    }

    #[tokio::test]
    async fn flush_forwards_the_partial_frame() {
        let (stream, sent) = stream_with_script(vec![SttVendorEvent::Open]);

        // 300 loud samples: less than one 500-sample vendor frame, so only
        // the flush marker can surface it.
        let partial = AudioFrame::new(vec![3000i16; 300], 16000, 1);
        stream.push(partial).await.unwrap();
        stream.flush().await.unwrap();
        stream.end_input();

        loop {
            match stream.next_event().await {
                Some(SpeechEvent::Disconnected) | None => break,
                Some(_) => {}
            }
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1, "flush must emit the buffered partial frame");
        assert_eq!(sent[0].len(), 600, "300 samples of 16-bit PCM");
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let (stream, _) = stream_with_script(vec![]);
        stream.close();
        let frame = AudioFrame::new(vec![0i16; 10], 16000, 1);
        assert!(stream.push(frame).await.is_err());
    }
}
