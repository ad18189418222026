//! Spectrum/waveform analyser with Web Audio `AnalyserNode` byte semantics.
//!
//! Keeps the most recent `fft_size` samples. Frequency bytes come from a
//! Blackman-windowed FFT, smoothed over time, converted to dB and mapped
//! linearly from `[min_db, max_db]` onto `0..=255`. Waveform bytes are
//! `128 + 128 * x`, clamped.

use std::f32::consts::PI;

use super::fft::fft_in_place;
use crate::analysis::AnalyserNode;
use crate::config::Settings;

pub struct Analyser {
    fft_size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    window: Vec<f32>,
    /// Circular history of the last `fft_size` samples
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    re: Vec<f32>,
    im: Vec<f32>,
}

fn blackman(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

impl Analyser {
    /// `fft_size` must be a power of two; it is rounded up otherwise.
    pub fn new(fft_size: usize, smoothing: f32, min_db: f32, max_db: f32) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 0.999),
            min_db,
            max_db,
            window: blackman(fft_size),
            history: vec![0.0; fft_size],
            write_pos: 0,
            smoothed: vec![0.0; fft_size / 2],
            re: vec![0.0; fft_size],
            im: vec![0.0; fft_size],
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.fft_size,
            settings.smoothing,
            settings.min_decibels,
            settings.max_decibels,
        )
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// `i`-th sample of the history, oldest first
    fn sample(&self, i: usize) -> f32 {
        self.history[(self.write_pos + i) % self.fft_size]
    }

    fn update_spectrum(&mut self) {
        for i in 0..self.fft_size {
            self.re[i] = self.sample(i) * self.window[i];
        }
        self.im.fill(0.0);
        fft_in_place(&mut self.re, &mut self.im);

        let scale = 1.0 / self.fft_size as f32;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = (self.re[k] * self.re[k] + self.im[k] * self.im[k]).sqrt() * scale;
            let next = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            *smoothed = if next.is_finite() { next } else { 0.0 };
        }
    }

    fn db_to_byte(&self, magnitude: f32) -> u8 {
        if magnitude <= 0.0 {
            return 0;
        }
        let db = 20.0 * magnitude.log10();
        let scaled = 255.0 * (db - self.min_db) / (self.max_db - self.min_db);
        scaled.clamp(0.0, 255.0) as u8
    }
}

impl AnalyserNode for Analyser {
    fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn fill_frequency(&mut self, out: &mut [u8]) {
        self.update_spectrum();
        for (k, byte) in out.iter_mut().enumerate() {
            *byte = self
                .smoothed
                .get(k)
                .map_or(0, |&magnitude| self.db_to_byte(magnitude));
        }
    }

    fn fill_waveform(&mut self, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            let sample = if i < self.fft_size { self.sample(i) } else { 0.0 };
            *byte = (128.0 + 128.0 * sample).clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence() {
        let mut analyser = Analyser::new(64, 0.0, -100.0, -30.0);
        let mut fft = [1u8; 32];
        let mut wave = [0u8; 64];
        analyser.fill_frequency(&mut fft);
        analyser.fill_waveform(&mut wave);

        assert!(fft.iter().all(|&b| b == 0));
        assert!(wave.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_waveform_is_chronological_and_clamped() {
        let mut analyser = Analyser::new(32, 0.0, -100.0, -30.0);
        let mut samples = vec![0.0; 30];
        samples.extend([0.5, 2.0]);
        analyser.push_samples(&samples);

        let mut wave = [0u8; 32];
        analyser.fill_waveform(&mut wave);
        assert_eq!(wave[30], 192);
        assert_eq!(wave[31], 255);
        assert_eq!(wave[0], 128);
    }

    #[test]
    fn test_tone_peaks_in_expected_bin() {
        let size = 256;
        let mut analyser = Analyser::new(size, 0.0, -100.0, 0.0);
        let bin = 16;
        let tone: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * bin as f32 * i as f32 / size as f32).sin())
            .collect();
        analyser.push_samples(&tone);

        let mut fft = vec![0u8; size / 2];
        analyser.fill_frequency(&mut fft);
        let loudest = fft
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(loudest, bin);
        assert!(fft[bin] > fft[bin + 8]);
    }

    #[test]
    fn test_smoothing_lags_behind() {
        let size = 64;
        let mut analyser = Analyser::new(size, 0.9, -100.0, 0.0);
        let tone: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * 4.0 * i as f32 / size as f32).sin())
            .collect();
        analyser.push_samples(&tone);

        let mut first = vec![0u8; size / 2];
        analyser.fill_frequency(&mut first);
        let mut second = vec![0u8; size / 2];
        analyser.fill_frequency(&mut second);
        assert!(second[4] > first[4]);
    }
}
