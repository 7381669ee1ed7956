//! Voice-activity scoring
//!
//! An [`ActivityModel`] maps a chunk of PCM audio to a speech score in
//! `[0.0, 1.0]`. Acoustic models plug in through the trait; [`EnergyModel`]
//! is the built-in RMS heuristic and the fallback whenever a model errs.

use crate::Result;

/// Scores a chunk of 16-bit PCM for voice activity
pub trait ActivityModel: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Speech score for the chunk, `0.0` (silence) to `1.0` (speech)
    ///
    /// # Errors
    ///
    /// Returns `Error::Segmentation` if the model cannot score the chunk
    fn score(&self, samples: &[i16]) -> Result<f32>;
}

/// RMS energy heuristic
///
/// An RMS equal to `speech_rms` scores exactly `0.5`, twice that saturates at `1.0`.
#[derive(Debug, Clone, Copy)]
pub struct EnergyModel {
    speech_rms: f32,
}

impl Default for EnergyModel {
    fn default() -> Self {
        // Typical close-mic speech sits well above this, room noise well below
        Self { speech_rms: 800.0 }
    }
}

impl EnergyModel {
    /// Create a heuristic calibrated to the given speech RMS level
    #[must_use]
    pub const fn new(speech_rms: f32) -> Self {
        Self { speech_rms }
    }

    /// Score without the `Result` wrapper; the heuristic cannot fail
    #[must_use]
    pub fn energy_score(&self, samples: &[i16]) -> f32 {
        if self.speech_rms <= 0.0 {
            return 0.0;
        }
        (rms(samples) / (2.0 * self.speech_rms)).min(1.0)
    }
}

impl ActivityModel for EnergyModel {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn score(&self, samples: &[i16]) -> Result<f32> {
        Ok(self.energy_score(samples))
    }
}

/// Root-mean-square amplitude of 16-bit samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    #[allow(clippy::cast_possible_truncation)]
    let mean = (sum_squares / samples.len() as f64).sqrt() as f32;
    mean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert!(rms(&[]) < f32::EPSILON);
        assert!(rms(&[0; 160]) < f32::EPSILON);
        assert!((rms(&[1000; 160]) - 1000.0).abs() < 0.01);
    }

    #[test]
    fn test_energy_score_calibration() {
        let model = EnergyModel::default();
        assert!(model.energy_score(&[0; 160]) < 0.01);
        assert!((model.energy_score(&[800; 160]) - 0.5).abs() < 0.01);
        assert!((model.energy_score(&[i16::MAX; 160]) - 1.0).abs() < f32::EPSILON);
    }
}
