//! The per-call AI listener/responder pipeline.
//!
//! Raw RTP from a tapped producer track flows through packet parsing and
//! Opus decoding into fixed-duration audio frames, past an RMS energy gate
//! into a live transcription session, whose speech events drive an
//! incrementally-streamed coaching model. Stages communicate exclusively
//! through closable bounded queues; `interrupt()` on the coaching stream is
//! the barge-in primitive.

pub mod agent;
pub mod byte_stream;
pub mod codec;
pub mod energy;
pub mod error;
pub mod frame;
pub mod llm;
pub mod queue;
pub mod rtp_stream;
pub mod stt;

pub use agent::AgentPipeline;
pub use byte_stream::AudioByteStream;
pub use codec::{strip_rtp_payload, OpusAudioDecoder, OpusAudioEncoder, RtpPacketizer};
pub use energy::AudioEnergyFilter;
pub use error::PipelineError;
pub use frame::AudioFrame;
pub use llm::{ChatMessage, ChatModel, ChatRole, CoachingUtterance, Llm, LlmOptions, LlmStream};
pub use queue::StreamingQueue;
pub use rtp_stream::{PcmInput, RtpStream};
pub use stt::{
    AudioInput, SpeechData, SpeechEvent, SttAudioSink, SttConnector, SttEventSource, SttOptions,
    SttSession, SttStream, SttVendorEvent,
};
