//! Outbound audio: PCM buffers → Opus payloads → RTP packets.

use crate::codec::{OpusAudioEncoder, RtpPacketizer};
use crate::error::PipelineError;
use crate::queue::StreamingQueue;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Queue depth between the producer of PCM buffers and the encoder task.
const RTP_STREAM_DEPTH: usize = 64;

/// Input to the outbound stream.
pub enum PcmInput {
    /// One interleaved 16-bit PCM buffer sized to a valid Opus frame.
    Chunk(Bytes),
    /// Marker with no audio of its own; ignored by the encoder.
    Flush,
}

/// Encodes and packetizes outbound PCM, preserving arrival order.
pub struct RtpStream {
    input: StreamingQueue<PcmInput>,
    output: StreamingQueue<Bytes>,
    interrupted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RtpStream {
    pub fn start(
        ssrc: u32,
        sample_rate: u32,
        channels: u16,
        samples_per_channel: u32,
    ) -> Result<Self, PipelineError> {
        let input: StreamingQueue<PcmInput> = StreamingQueue::bounded(RTP_STREAM_DEPTH);
        let output: StreamingQueue<Bytes> = StreamingQueue::bounded(RTP_STREAM_DEPTH);
        let interrupted = Arc::new(AtomicBool::new(false));

        let mut encoder = OpusAudioEncoder::new(sample_rate, channels)?;
        let mut packetizer = RtpPacketizer::new(ssrc, samples_per_channel);

        let task = {
            let input = input.clone();
            let output = output.clone();
            let interrupted = interrupted.clone();
            tokio::spawn(async move {
                while let Some(item) = input.get().await {
                    if interrupted.load(Ordering::Acquire) {
                        break;
                    }
                    let chunk = match item {
                        PcmInput::Chunk(chunk) => chunk,
                        PcmInput::Flush => continue,
                    };

                    let pcm: Vec<i16> = chunk
                        .chunks_exact(2)
                        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                        .collect();

                    let packet = encoder
                        .encode(&pcm)
                        .and_then(|payload| packetizer.packetize(payload));
                    match packet {
                        Ok(packet) => {
                            if interrupted.load(Ordering::Acquire) {
                                break;
                            }
                            if output.put(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // A malformed buffer must not kill the stream.
                            tracing::error!("failed to handle output stream: {}", e);
                        }
                    }
                }
                output.close();
            })
        };

        Ok(Self {
            input,
            output,
            interrupted,
            task,
        })
    }

    /// Queues one PCM buffer for encoding.
    pub async fn push(&self, chunk: Bytes) -> Result<(), PipelineError> {
        self.input.put(PcmInput::Chunk(chunk)).await
    }

    pub async fn flush(&self) -> Result<(), PipelineError> {
        self.input.put(PcmInput::Flush).await
    }

    /// The next outbound RTP packet, or `None` once the stream ends.
    pub async fn next_packet(&self) -> Option<Bytes> {
        self.output.get().await
    }

    /// Stops emission; generation already queued is discarded.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.input.close();
        self.output.close();
        self.task.abort();
    }
}
