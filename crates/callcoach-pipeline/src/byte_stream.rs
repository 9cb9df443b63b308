//! Reassembles arbitrary-sized byte chunks into fixed-duration frames.

use crate::frame::AudioFrame;

/// Buffers raw little-endian PCM bytes and emits complete [`AudioFrame`]s.
///
/// The frame size defaults to `sample_rate / 50` samples per channel
/// (20 ms), matching what streaming transcription vendors expect and
/// bounding per-frame latency.
pub struct AudioByteStream {
    sample_rate: u32,
    channels: u16,
    bytes_per_frame: usize,
    buffer: Vec<u8>,
}

impl AudioByteStream {
    pub fn new(sample_rate: u32, channels: u16, samples_per_channel: Option<usize>) -> Self {
        let samples_per_channel =
            samples_per_channel.unwrap_or_else(|| (sample_rate / 50) as usize);
        Self {
            sample_rate,
            channels,
            bytes_per_frame: channels as usize * samples_per_channel * 2,
            buffer: Vec::new(),
        }
    }

    /// Appends bytes and returns every complete frame now available.
    ///
    /// Any remainder is retained for the next write, so the emitted frame
    /// sequence is independent of how the input was chunked.
    pub fn write(&mut self, data: &[u8]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.bytes_per_frame {
            let frame_bytes: Vec<u8> = self.buffer.drain(..self.bytes_per_frame).collect();
            frames.push(self.frame_from_bytes(&frame_bytes));
        }
        frames
    }

    /// Emits the final partial frame.
    ///
    /// The buffered length must be an exact multiple of one sample
    /// (`2 × channels` bytes); anything else is dropped with a warning
    /// rather than corrupting sample alignment.
    pub fn flush(&mut self) -> Vec<AudioFrame> {
        let sample_bytes = 2 * self.channels as usize;
        if self.buffer.len() % sample_bytes != 0 {
            tracing::warn!(
                buffered = self.buffer.len(),
                "incomplete frame during flush, dropping"
            );
            self.buffer.clear();
            return Vec::new();
        }
        if self.buffer.is_empty() {
            return Vec::new();
        }

        let bytes: Vec<u8> = self.buffer.drain(..).collect();
        vec![self.frame_from_bytes(&bytes)]
    }

    fn frame_from_bytes(&self, bytes: &[u8]) -> AudioFrame {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        AudioFrame::new(samples, self.sample_rate, self.channels)
    }
}
