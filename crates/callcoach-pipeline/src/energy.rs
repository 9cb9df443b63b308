//! RMS energy gate deciding which frames reach transcription.

use crate::frame::AudioFrame;

/// RMS threshold above which a frame counts as active speech.
const RMS_THRESHOLD: f32 = 0.004;

/// Passes frames with speech energy, plus a cooldown window of quiet
/// frames after the last loud one so trailing syllables are not chopped
/// off. Once the cooldown is exhausted, silence is suppressed.
pub struct AudioEnergyFilter {
    cooldown_seconds: f32,
    cooldown: f32,
}

impl Default for AudioEnergyFilter {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl AudioEnergyFilter {
    pub fn new(cooldown_seconds: f32) -> Self {
        Self {
            cooldown_seconds,
            cooldown: cooldown_seconds,
        }
    }

    /// Whether `frame` should be forwarded to transcription.
    ///
    /// A frame above the threshold always passes and resets the cooldown;
    /// a quiet frame passes while cooldown remains, decrementing it by the
    /// frame's duration.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> bool {
        if !frame.data.is_empty() {
            let sum_squares: f32 = frame
                .data
                .iter()
                .map(|&sample| {
                    let normalized = sample as f32 / 32768.0;
                    normalized * normalized
                })
                .sum();
            let rms = (sum_squares / frame.data.len() as f32).sqrt();
            if rms > RMS_THRESHOLD {
                self.cooldown = self.cooldown_seconds;
                return true;
            }
        }

        self.cooldown -= frame.duration_secs();
        self.cooldown > 0.0
    }
}
