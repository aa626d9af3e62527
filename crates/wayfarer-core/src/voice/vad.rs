//! Energy-based voice activity detection on 16-bit PCM.

use std::time::Duration;

/// One chunk of mono 16-bit PCM audio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode little-endian PCM bytes. A trailing odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    pub fn duration(&self, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / sample_rate as f64)
    }

    pub fn rms(&self) -> f64 {
        rms(&self.samples)
    }
}

pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSignal {
    Speech,
    Silence,
    /// Enough trailing silence after speech.
    EndOfUtterance,
}

/// Tracks speech followed by trailing silence.
#[derive(Debug, Clone)]
pub struct EndpointDetector {
    threshold: f64,
    silence_needed: Duration,
    sample_rate: u32,
    heard_speech: bool,
    trailing_silence: Duration,
}

impl EndpointDetector {
    pub fn new(threshold: u16, silence_needed: Duration, sample_rate: u32) -> Self {
        Self {
            threshold: threshold as f64,
            silence_needed,
            sample_rate,
            heard_speech: false,
            trailing_silence: Duration::ZERO,
        }
    }

    pub fn is_speech(&self, frame: &AudioFrame) -> bool {
        frame.rms() >= self.threshold
    }

    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    pub fn observe(&mut self, frame: &AudioFrame) -> VadSignal {
        if self.is_speech(frame) {
            self.heard_speech = true;
            self.trailing_silence = Duration::ZERO;
            return VadSignal::Speech;
        }
        if !self.heard_speech {
            return VadSignal::Silence;
        }
        self.trailing_silence += frame.duration(self.sample_rate);
        if self.trailing_silence >= self.silence_needed {
            VadSignal::EndOfUtterance
        } else {
            VadSignal::Silence
        }
    }

    pub fn reset(&mut self) {
        self.heard_speech = false;
        self.trailing_silence = Duration::ZERO;
    }
}
