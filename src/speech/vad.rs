//! Voice-activity detection.
//!
//! Classifies a single chunk as speech or non-speech in well under a
//! millisecond, so it runs inline on the frame loop before anything is
//! buffered. Model-backed detectors plug in behind the same trait; the
//! default is the RMS-energy heuristic.

pub trait VoiceActivityDetector: Send + Sync {
    fn has_speech(&self, chunk: &[f32]) -> bool;
}

/// Maps the configured confidence threshold (0.0-1.0, as a model VAD would
/// consume it) onto an RMS energy floor.
const ENERGY_SCALE: f32 = 0.02;

pub struct EnergyVad {
    energy_threshold: f32,
}

impl EnergyVad {
    pub fn from_confidence(threshold: f32) -> Self {
        Self {
            energy_threshold: threshold * ENERGY_SCALE,
        }
    }

    pub fn with_energy_threshold(energy_threshold: f32) -> Self {
        Self { energy_threshold }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn has_speech(&self, chunk: &[f32]) -> bool {
        if chunk.is_empty() {
            return false;
        }
        let sum_squares: f64 = chunk.iter().map(|&s| (s as f64).powi(2)).sum();
        let rms = (sum_squares / chunk.len() as f64).sqrt();
        rms > self.energy_threshold as f64
    }
}
