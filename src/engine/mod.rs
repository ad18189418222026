//! In-process chain runtime
//!
//! Parses and compiles Glicol-style chain code, renders it block by block on
//! top of the DSP building blocks and taps the output for analysis.

mod buffer_bridge;
mod executor;
mod graph;
mod param_injector;
pub mod parser;
mod wrapper;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use buffer_bridge::{output_tap, OutputTap, TapReader, TapSource};
pub use executor::{LocalExecutor, RunSignal};
pub use graph::{Graph, ParamSource, RenderContext};
pub use param_injector::{ParamInjector, PARAM_NAMES};
pub use wrapper::ChainRuntime;

use crate::pattern::CycleClock;

/// Fixed render block size
pub const BLOCK_SIZE: usize = 128;

/// Beats per cycle
const BEATS_PER_CYCLE: f64 = 4.0;

struct TransportState {
    samples: AtomicU64,
    bpm_bits: AtomicU32,
    sample_rate: u32,
}

/// Shared sample clock of a runtime.
///
/// Cloning shares the same position, so the highlighter can read the cycle
/// the audio side is currently rendering.
#[derive(Clone)]
pub struct Transport {
    state: Arc<TransportState>,
}

impl Transport {
    pub fn new(sample_rate: u32, bpm: f32) -> Self {
        Self {
            state: Arc::new(TransportState {
                samples: AtomicU64::new(0),
                bpm_bits: AtomicU32::new(bpm.to_bits()),
                sample_rate: sample_rate.max(1),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.sample_rate
    }

    pub fn samples(&self) -> u64 {
        self.state.samples.load(Ordering::Acquire)
    }

    pub fn advance(&self, samples: u64) {
        self.state.samples.fetch_add(samples, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        self.state.samples.store(0, Ordering::Release);
    }

    pub fn bpm(&self) -> f32 {
        f32::from_bits(self.state.bpm_bits.load(Ordering::Relaxed))
    }

    /// Ignored unless positive and finite
    pub fn set_bpm(&self, bpm: f32) {
        if bpm.is_finite() && bpm > 0.0 {
            self.state.bpm_bits.store(bpm.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn samples_per_cycle(&self) -> f64 {
        self.state.sample_rate as f64 * 60.0 / self.bpm() as f64 * BEATS_PER_CYCLE
    }

    /// Position in milliseconds of rendered audio
    pub fn millis(&self) -> f64 {
        self.samples() as f64 * 1000.0 / self.state.sample_rate as f64
    }
}

impl CycleClock for Transport {
    fn cycle(&self) -> f64 {
        self.samples() as f64 / self.samples_per_cycle()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("samples", &self.samples())
            .field("bpm", &self.bpm())
            .field("sample_rate", &self.sample_rate())
            .finish()
    }
}
