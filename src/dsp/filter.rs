//! Resonant biquad filters (`lpf`, `hpf` nodes)
//!
//! RBJ cookbook coefficients in direct form I. Cutoff may be modulated, so
//! coefficients are recomputed only when the cutoff or Q actually moves.

use super::Processor;
use std::f32::consts::PI;

/// Biquad filter coefficients
#[derive(Clone, Copy, Debug)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain passthrough
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

#[derive(Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    fn process(&mut self, input: f32, c: &BiquadCoeffs) -> f32 {
        let out = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = out;
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    HighPass,
}

fn calc_coeffs(kind: FilterKind, freq: f32, q: f32, sample_rate: f32) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq / sample_rate;
    let cos_w0 = w0.cos();
    let alpha = w0.sin() / (2.0 * q);
    let a0 = 1.0 + alpha;

    let (b0, b1, b2) = match kind {
        FilterKind::LowPass => {
            let b1 = 1.0 - cos_w0;
            (b1 / 2.0, b1, b1 / 2.0)
        }
        FilterKind::HighPass => {
            let b1 = -(1.0 + cos_w0);
            (-b1 / 2.0, b1, -b1 / 2.0)
        }
    };

    BiquadCoeffs {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: (-2.0 * cos_w0) / a0,
        a2: (1.0 - alpha) / a0,
    }
}

pub struct Biquad {
    kind: FilterKind,
    state: BiquadState,
    coeffs: BiquadCoeffs,
    cutoff: f32,
    q: f32,
    sample_rate: f32,
}

impl Biquad {
    pub fn new(kind: FilterKind, sample_rate: f32) -> Self {
        let mut filter = Self {
            kind,
            state: BiquadState::default(),
            coeffs: BiquadCoeffs::default(),
            cutoff: 0.0,
            q: 0.0,
            sample_rate,
        };
        filter.set(1000.0, std::f32::consts::FRAC_1_SQRT_2);
        filter
    }

    /// Set cutoff (clamped to 10 Hz..0.45*sr) and Q (0.1..20).
    pub fn set(&mut self, cutoff: f32, q: f32) {
        let cutoff = if cutoff.is_finite() { cutoff } else { 1000.0 };
        let cutoff = cutoff.clamp(10.0, self.sample_rate * 0.45);
        let q = if q.is_finite() { q.clamp(0.1, 20.0) } else { 0.707 };
        if (self.cutoff - cutoff).abs() > 0.01 || (self.q - q).abs() > 0.0001 {
            self.cutoff = cutoff;
            self.q = q;
            self.coeffs = calc_coeffs(self.kind, cutoff, q, self.sample_rate);
        }
    }
}

impl Processor for Biquad {
    fn process(&mut self, input: f32) -> f32 {
        self.state.process(input, &self.coeffs)
    }

    fn reset(&mut self) {
        self.state = BiquadState::default();
    }
}
