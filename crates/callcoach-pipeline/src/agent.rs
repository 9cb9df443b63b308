//! The per-call listener/responder.
//!
//! Composes packet parsing → Opus decode → framing/energy gate →
//! transcription → coaching into one pipeline fed by the agent's loopback
//! consumer track. Final transcripts accumulate per utterance; the vendor's
//! end-of-speech endpoint triggers a coaching turn, and a fresh speech
//! start while the coach is talking barges it in.

use crate::codec::{strip_rtp_payload, OpusAudioDecoder};
use crate::error::PipelineError;
use crate::frame::AudioFrame;
use crate::llm::{ChatModel, CoachingUtterance, Llm, LlmStream};
use crate::rtp_stream::RtpStream;
use crate::stt::{SpeechEvent, SttConnector, SttOptions, SttStream};
use bytes::Bytes;
use callcoach_media::{Consumer, DirectTransport, Producer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The assembled per-call pipeline.
///
/// Owns its loopback transport and both tracks; `close()` tears everything
/// down exactly once.
pub struct AgentPipeline {
    stt: Arc<SttStream>,
    llm_stream: LlmStream,
    rtp_out: Arc<RtpStream>,
    producer: Arc<Producer>,
    listener: Arc<Consumer>,
    transport: Arc<DirectTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AgentPipeline {
    /// Wires and starts the pipeline for one call.
    ///
    /// `listener` is the unpaused loopback consumer tapping the speaker's
    /// producer track; `producer` is the loopback producer carrying the
    /// agent's outbound audio; `ssrc` is the tapped stream's identity.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        system_prompt: &str,
        topic_prompt: &str,
        transport: Arc<DirectTransport>,
        listener: Arc<Consumer>,
        producer: Arc<Producer>,
        ssrc: u32,
        stt_connector: &dyn SttConnector,
        stt_options: SttOptions,
        chat_model: Arc<dyn ChatModel>,
        suggestions_tx: mpsc::Sender<CoachingUtterance>,
    ) -> Result<Arc<Self>, PipelineError> {
        let rtp_rx = listener
            .take_rtp()
            .ok_or_else(|| PipelineError::Rtp("listener rtp stream already taken".to_string()))?;

        let session = stt_connector.connect(&stt_options).await?;
        let stt = SttStream::start(session, stt_options.clone());

        let llm = Llm::new(chat_model, system_prompt, topic_prompt);
        let llm_stream = llm.chat();

        let rtp_out = Arc::new(RtpStream::start(
            ssrc,
            stt_options.sample_rate,
            stt_options.channels,
            stt_options.sample_rate / 50,
        )?);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_ingest(
            rtp_rx,
            stt.clone(),
            stt_options.clone(),
        )));
        tasks.push(tokio::spawn(run_speech_events(
            stt.clone(),
            llm_stream.clone(),
        )));
        tasks.push(tokio::spawn(run_suggestions(
            llm_stream.clone(),
            suggestions_tx,
        )));
        tasks.push(tokio::spawn(run_outbound(
            rtp_out.clone(),
            producer.clone(),
        )));

        Ok(Arc::new(Self {
            stt,
            llm_stream,
            rtp_out,
            producer,
            listener,
            transport,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }))
    }

    /// Queues outbound PCM for the agent's producer track.
    pub async fn push_outbound_pcm(&self, pcm: Bytes) -> Result<(), PipelineError> {
        self.rtp_out.push(pcm).await
    }

    /// Barge-in on the current coaching turn.
    pub fn interrupt(&self) {
        self.llm_stream.interrupt();
    }

    /// Tears the pipeline down: stages, queues, tracks, and the loopback
    /// transport. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stt.close();
        self.llm_stream.close();
        self.rtp_out.close();
        self.producer.close();
        self.listener.close();
        self.transport.close();
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
        tracing::debug!("agent pipeline closed");
    }
}

/// Inbound RTP → payload → PCM frames → transcription input.
async fn run_ingest(
    mut rtp_rx: mpsc::Receiver<Bytes>,
    stt: Arc<SttStream>,
    options: SttOptions,
) {
    let mut decoder = match OpusAudioDecoder::new(options.sample_rate, options.channels) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!("failed to create inbound decoder: {}", e);
            return;
        }
    };

    while let Some(packet) = rtp_rx.recv().await {
        let payload = match strip_rtp_payload(&packet) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("dropping unparsable rtp packet: {}", e);
                continue;
            }
        };
        let pcm = match decoder.decode(&payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!("dropping undecodable payload: {}", e);
                continue;
            }
        };
        let frame = AudioFrame::new(pcm, options.sample_rate, options.channels);
        if stt.push(frame).await.is_err() {
            break;
        }
    }

    stt.end_input();
}

/// Speech events → per-utterance transcript accumulation → coaching turns.
async fn run_speech_events(stt: Arc<SttStream>, llm_stream: LlmStream) {
    let mut utterance = String::new();

    while let Some(event) = stt.next_event().await {
        match event {
            SpeechEvent::SpeechStarted => {
                // The caller is talking again; the coach stops talking.
                llm_stream.interrupt();
            }
            SpeechEvent::FinalTranscript { alternatives } => {
                if let Some(best) = alternatives.first() {
                    if !best.text.is_empty() {
                        if !utterance.is_empty() {
                            utterance.push(' ');
                        }
                        utterance.push_str(&best.text);
                    }
                }
            }
            SpeechEvent::EndOfSpeech => {
                let text = std::mem::take(&mut utterance);
                if !text.is_empty() {
                    let llm_stream = llm_stream.clone();
                    // The turn streams concurrently so barge-in can land
                    // while generation is still running.
                    tokio::spawn(async move {
                        llm_stream.send_chat(&text).await;
                    });
                }
            }
            SpeechEvent::Disconnected => break,
            SpeechEvent::Connected | SpeechEvent::InterimTranscript { .. } => {}
        }
    }
}

/// Coaching utterances → the gateway's per-user channel.
async fn run_suggestions(llm_stream: LlmStream, suggestions_tx: mpsc::Sender<CoachingUtterance>) {
    while let Some(utterance) = llm_stream.next_utterance().await {
        if suggestions_tx.send(utterance).await.is_err() {
            break;
        }
    }
}

/// Outbound packets → the agent's producer track.
async fn run_outbound(rtp_out: Arc<RtpStream>, producer: Arc<Producer>) {
    while let Some(packet) = rtp_out.next_packet().await {
        if let Err(e) = producer.write_rtp(packet) {
            tracing::warn!("agent producer write failed: {}", e);
            break;
        }
    }
}
