//! Test tone generation
//!
//! Produces one value per tick: a slow sine sweep with a quieter tone on
//! top, kept below full scale. The CLI host feeds these values to the sink.

use std::f64::consts::TAU;

/// Default tone frequency in Hz
pub const DEFAULT_TONE_FREQ: f64 = 400.0;

/// Amplitude of the slow component
const SWEEP_AMPLITUDE: f64 = 0.7;
/// Phase advance of the slow component per sample
const SWEEP_RATE: f64 = 0.00001;
/// Amplitude of the tone
const TONE_AMPLITUDE: f64 = 0.1;

/// Slow sine plus tone generator
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    /// Tone frequency in Hz
    freq: f64,
    /// Phase advance of the tone per sample
    step: f64,
    /// Current tone phase in radians, kept in [0, 2π)
    phase: f64,
    /// Samples generated so far
    count: u64,
}

impl ToneGenerator {
    /// Create a generator
    ///
    /// # Arguments
    /// * `freq` - Tone frequency in Hz
    /// * `rate` - Sample rate the values are generated for
    ///
    /// # Example
    /// ```
    /// use alsasink_core::signal::ToneGenerator;
    ///
    /// let mut tone = ToneGenerator::new(400.0, 44100);
    /// let v = tone.next_sample();
    /// assert!(v.abs() <= 0.8);
    /// ```
    pub fn new(freq: f64, rate: u32) -> Self {
        Self {
            freq,
            step: TAU * freq / rate.max(1) as f64,
            phase: 0.0,
            count: 0,
        }
    }

    pub fn freq(&self) -> f64 {
        self.freq
    }

    /// Next value in [-0.8, 0.8]
    pub fn next_sample(&mut self) -> f64 {
        let value = SWEEP_AMPLITUDE * (SWEEP_RATE * self.count as f64).sin()
            + TONE_AMPLITUDE * self.phase.sin();
        self.count += 1;
        self.phase += self.step;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        value
    }

    /// Fill every channel of `frame` with the next value
    pub fn fill(&mut self, frame: &mut [f64]) {
        let value = self.next_sample();
        frame.fill(value);
    }

    /// Next value replicated across `channels` channels
    pub fn next_vector(&mut self, channels: usize) -> Vec<f64> {
        vec![self.next_sample(); channels]
    }

    /// Restart from phase zero
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_starts_at_zero() {
        let mut tone = ToneGenerator::new(DEFAULT_TONE_FREQ, 44100);
        assert_abs_diff_eq!(tone.next_sample(), 0.0);
    }

    #[test]
    fn test_stays_in_range() {
        let mut tone = ToneGenerator::new(1000.0, 8000);
        for _ in 0..200_000 {
            let v = tone.next_sample();
            assert!(v.abs() <= SWEEP_AMPLITUDE + TONE_AMPLITUDE + 1e-12);
        }
    }

    #[test]
    fn test_tone_period() {
        // at rate = 4 * freq the tone repeats every four samples
        let mut tone = ToneGenerator::new(100.0, 400);
        tone.next_sample();
        let quarter = tone.next_sample();
        let sweep = SWEEP_AMPLITUDE * SWEEP_RATE.sin();
        assert_abs_diff_eq!(quarter, sweep + TONE_AMPLITUDE, epsilon = 1e-12);
    }

    #[test]
    fn test_vector_and_reset() {
        let mut tone = ToneGenerator::new(440.0, 48000);
        let first = tone.next_vector(3);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|&v| v == first[0]));

        let mut frame = [1.0; 2];
        tone.fill(&mut frame);
        assert_eq!(frame[0], frame[1]);

        tone.reset();
        assert_abs_diff_eq!(tone.next_sample(), first[0]);
    }
}
