//! Signal processing building blocks
//!
//! Mono processors used by the chain runtime (`delay`, `filter`) and the
//! spectrum analyser that feeds audio-reactive consumers (`fft`, `analyser`).

pub mod analyser;
pub mod delay;
pub mod fft;
pub mod filter;

pub use analyser::Analyser;

/// A mono, sample-at-a-time processor.
pub trait Processor: Send {
    /// Process a single sample
    fn process(&mut self, input: f32) -> f32;

    /// Clear internal state (delay lines, filter history)
    fn reset(&mut self);

    /// Process a block in place
    fn process_block(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.process(*sample);
        }
    }
}

/// MIDI note number to frequency in Hz
pub fn mtof(note: f32) -> f32 {
    440.0 * 2.0_f32.powf((note - 69.0) / 12.0)
}
