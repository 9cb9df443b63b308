//! RTP packet manipulation and Opus transcoding.

use crate::error::PipelineError;
use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;
use webrtc_util::marshal::{Marshal, Unmarshal};

/// Payload type used for outbound packets, matching the router's Opus
/// codec mapping.
pub const RTP_PAYLOAD_TYPE: u8 = 100;

/// Parses an inbound RTP packet, strips header extensions, and returns the
/// payload.
pub fn strip_rtp_payload(packet: &[u8]) -> Result<Bytes, PipelineError> {
    let mut buf = packet;
    let mut parsed = Packet::unmarshal(&mut buf)
        .map_err(|e| PipelineError::Rtp(format!("failed to parse rtp packet: {e}")))?;

    parsed.header.extension = false;
    parsed.header.extension_profile = 0;
    parsed.header.extensions.clear();

    Ok(parsed.payload)
}

/// Builds outbound RTP packets with monotonically increasing sequence
/// numbers and timestamps, a fixed SSRC and payload type.
pub struct RtpPacketizer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    samples_per_channel: u32,
}

impl RtpPacketizer {
    pub fn new(ssrc: u32, samples_per_channel: u32) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            ssrc,
            samples_per_channel,
        }
    }

    /// Wraps one encoded payload in an RTP packet.
    ///
    /// The timestamp advances by the frame's samples per channel, so packet
    /// pacing mirrors the audio clock.
    pub fn packetize(&mut self, payload: Bytes) -> Result<Bytes, PipelineError> {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: RTP_PAYLOAD_TYPE,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_channel);

        packet
            .marshal()
            .map_err(|e| PipelineError::Rtp(format!("failed to build rtp packet: {e}")))
    }
}

/// PCM → Opus encoder for the outbound audio path.
pub struct OpusAudioEncoder {
    encoder: audiopus::coder::Encoder,
    output: Vec<u8>,
}

impl OpusAudioEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, PipelineError> {
        let encoder = audiopus::coder::Encoder::new(
            opus_sample_rate(sample_rate)?,
            opus_channels(channels)?,
            audiopus::Application::Voip,
        )
        .map_err(|e| PipelineError::Codec(format!("failed to create opus encoder: {e}")))?;
        Ok(Self {
            encoder,
            output: vec![0u8; 1500],
        })
    }

    /// Encodes one PCM frame (interleaved i16, a valid Opus frame length).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, PipelineError> {
        let written = self
            .encoder
            .encode(pcm, &mut self.output)
            .map_err(|e| PipelineError::Codec(format!("opus encode failed: {e}")))?;
        Ok(Bytes::copy_from_slice(&self.output[..written]))
    }
}

/// Opus → PCM decoder for the inbound audio path.
pub struct OpusAudioDecoder {
    decoder: audiopus::coder::Decoder,
    channels: usize,
    buffer: Vec<i16>,
}

impl OpusAudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, PipelineError> {
        let decoder =
            audiopus::coder::Decoder::new(opus_sample_rate(sample_rate)?, opus_channels(channels)?)
                .map_err(|e| PipelineError::Codec(format!("failed to create opus decoder: {e}")))?;
        // Sized for the maximum Opus frame duration (120 ms).
        let capacity = (sample_rate as usize * 120 / 1000) * channels as usize;
        Ok(Self {
            decoder,
            channels: channels as usize,
            buffer: vec![0i16; capacity],
        })
    }

    /// Decodes one Opus payload into interleaved PCM samples.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, PipelineError> {
        let samples_per_channel = self
            .decoder
            .decode(Some(payload), &mut self.buffer, false)
            .map_err(|e| PipelineError::Codec(format!("opus decode failed: {e}")))?;
        Ok(self.buffer[..samples_per_channel * self.channels].to_vec())
    }
}

fn opus_sample_rate(sample_rate: u32) -> Result<audiopus::SampleRate, PipelineError> {
    <audiopus::SampleRate as audiopus::TryFrom<i32>>::try_from(sample_rate as i32)
        .map_err(|e| PipelineError::Codec(format!("unsupported sample rate {sample_rate}: {e}")))
}

fn opus_channels(channels: u16) -> Result<audiopus::Channels, PipelineError> {
    <audiopus::Channels as audiopus::TryFrom<i32>>::try_from(channels as i32)
        .map_err(|e| PipelineError::Codec(format!("unsupported channel count {channels}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packetizer_advances_sequence_and_timestamp() {
        let mut packetizer = RtpPacketizer::new(0xdead_beef, 960);

        let first = packetizer.packetize(Bytes::from_static(b"one")).unwrap();
        let second = packetizer.packetize(Bytes::from_static(b"two")).unwrap();

        let mut buf = &first[..];
        let first = Packet::unmarshal(&mut buf).unwrap();
        let mut buf = &second[..];
        let second = Packet::unmarshal(&mut buf).unwrap();

        assert_eq!(first.header.sequence_number, 0);
        assert_eq!(second.header.sequence_number, 1);
        assert_eq!(first.header.timestamp, 0);
        assert_eq!(second.header.timestamp, 960);
        assert_eq!(first.header.ssrc, 0xdead_beef);
        assert_eq!(first.header.payload_type, RTP_PAYLOAD_TYPE);
        assert_eq!(&first.payload[..], b"one");
    }

    #[test]
    fn strip_removes_header_extensions() {
        let mut packet = Packet {
            header: Header {
                version: 2,
                payload_type: RTP_PAYLOAD_TYPE,
                sequence_number: 17,
                timestamp: 4800,
                ssrc: 99,
                ..Default::default()
            },
            payload: Bytes::from_static(b"opus-data"),
        };
        packet
            .header
            .set_extension(1, Bytes::from_static(&[0xAA]))
            .expect("extension should attach");
        assert!(packet.header.extension);

        let wire = packet.marshal().unwrap();
        let payload = strip_rtp_payload(&wire).unwrap();
        assert_eq!(&payload[..], b"opus-data");
    }

    #[test]
    fn strip_rejects_garbage() {
        let result = strip_rtp_payload(&[0x00, 0x01]);
        assert!(matches!(result, Err(PipelineError::Rtp(_))));
    }

    #[test]
    fn opus_round_trip_preserves_frame_shape() {
        let mut encoder = OpusAudioEncoder::new(48000, 2).unwrap();
        let mut decoder = OpusAudioDecoder::new(48000, 2).unwrap();

        // One 20 ms stereo frame of a quiet ramp.
        let pcm: Vec<i16> = (0..960 * 2).map(|i| (i % 128) as i16).collect();
        let payload = encoder.encode(&pcm).unwrap();
        assert!(!payload.is_empty());

        let decoded = decoder.decode(&payload).unwrap();
        assert_eq!(decoded.len(), pcm.len());
    }
}
