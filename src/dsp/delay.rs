//! Mono feedback delay (`delayms` node)
//!
//! Circular buffer with linear interpolation and a one-pole high-cut on the
//! feedback path so repeats darken.

use super::Processor;

/// Maximum delay time in seconds (determines buffer size)
const MAX_DELAY_SECONDS: f32 = 2.0;

/// High-cut applied to repeats
const FEEDBACK_HIGHCUT_HZ: f32 = 8000.0;

/// One-pole lowpass filter for high-cut on feedback
struct OnePole {
    coeff: f32,
    z1: f32,
}

impl OnePole {
    fn new() -> Self {
        Self { coeff: 0.5, z1: 0.0 }
    }

    fn set_cutoff(&mut self, freq: f32, sample_rate: f32) {
        // coeff = exp(-2*pi*freq/sr)
        let normalized = (freq / sample_rate).clamp(0.0, 0.5);
        self.coeff = (-std::f32::consts::TAU * normalized).exp();
    }

    fn process(&mut self, input: f32) -> f32 {
        self.z1 = (1.0 - self.coeff) * input + self.coeff * self.z1;
        self.z1
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
    }
}

pub struct Delay {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_samples: f32,
    feedback: f32,
    sample_rate: f32,
    filter: OnePole,
}

impl Delay {
    pub fn new(sample_rate: f32) -> Self {
        let buffer_size = (sample_rate * MAX_DELAY_SECONDS) as usize + 1;
        let mut filter = OnePole::new();
        filter.set_cutoff(FEEDBACK_HIGHCUT_HZ, sample_rate);
        Self {
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            delay_samples: 1.0,
            feedback: 0.0,
            sample_rate,
            filter,
        }
    }

    /// Set delay time in milliseconds (1-2000)
    pub fn set_time_ms(&mut self, ms: f32) {
        let ms = ms.clamp(1.0, MAX_DELAY_SECONDS * 1000.0);
        self.delay_samples = ms * self.sample_rate / 1000.0;
    }

    /// Set feedback amount (0.0-0.95)
    pub fn set_feedback(&mut self, feedback: f32) {
        self.feedback = feedback.clamp(0.0, 0.95);
    }

    fn read_interpolated(&self) -> f32 {
        let len = self.buffer.len();
        let mut read_pos = self.write_pos as f32 - self.delay_samples;
        if read_pos < 0.0 {
            read_pos += len as f32;
        }

        let index0 = read_pos.floor() as usize % len;
        let index1 = (index0 + 1) % len;
        let frac = read_pos.fract();

        self.buffer[index0] * (1.0 - frac) + self.buffer[index1] * frac
    }
}

impl Processor for Delay {
    /// Fully wet: the output is only the delayed signal.
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.read_interpolated();
        let filtered = self.filter.process(delayed);

        self.buffer[self.write_pos] = input + filtered * self.feedback;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();

        delayed
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_basic() {
        let mut delay = Delay::new(44100.0);
        delay.set_time_ms(100.0);

        let _ = delay.process(1.0);

        let delay_samples = (100.0 * 44100.0 / 1000.0) as usize;
        for _ in 0..delay_samples - 1 {
            assert!(delay.process(0.0).abs() < 0.01);
        }

        assert!(delay.process(0.0) > 0.9);
    }

    #[test]
    fn test_delay_feedback_decays() {
        let mut delay = Delay::new(44100.0);
        delay.set_time_ms(10.0);
        delay.set_feedback(0.5);

        let _ = delay.process(1.0);

        let delay_samples = (10.0 * 44100.0 / 1000.0) as usize;
        let mut first_echo = 0.0_f32;
        for _ in 0..delay_samples {
            first_echo = first_echo.max(delay.process(0.0));
        }
        let mut second_echo = 0.0_f32;
        for _ in 0..delay_samples {
            second_echo = second_echo.max(delay.process(0.0));
        }

        assert!(second_echo > 0.0);
        assert!(second_echo < first_echo);
    }

    #[test]
    fn test_reset_clears_line() {
        let mut delay = Delay::new(1000.0);
        delay.set_time_ms(5.0);
        let _ = delay.process(1.0);
        delay.reset();

        for _ in 0..20 {
            assert_eq!(delay.process(0.0), 0.0);
        }
    }
}
