use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use tracing::debug;

use super::Transport;
use crate::analysis::{AnalyserNode, AnalyserSource};
use crate::config::Settings;
use crate::dsp::Analyser;

/// Ring buffer capacity - a bit over a second of audio at 44.1kHz
const RING_BUFFER_SIZE: usize = 65536;

/// Scratch size used when draining the tap into the analyser
const DRAIN_CHUNK: usize = 1024;

/// Type aliases for ringbuf producer/consumer
pub type RbProducer<T> = ringbuf::HeapProd<T>;
pub type RbConsumer<T> = ringbuf::HeapCons<T>;

/// Create a connected tap: the runtime writes rendered blocks into the
/// [`OutputTap`], the analyser side reads them from the [`TapReader`].
pub fn output_tap() -> (OutputTap, TapReader) {
    let (producer, consumer) = HeapRb::<f32>::new(RING_BUFFER_SIZE).split();
    (
        OutputTap {
            producer,
            overrun_count: 0,
            samples_since_overrun_log: 0,
        },
        TapReader { consumer },
    )
}

/// Write side of the rendered-output tap
pub struct OutputTap {
    producer: RbProducer<f32>,

    // Overrun tracking
    overrun_count: u64,
    samples_since_overrun_log: u64,
}

impl OutputTap {
    /// Push a rendered block. Samples that do not fit are dropped; the
    /// reader only needs the most recent window anyway.
    pub fn push_block(&mut self, block: &[f32]) {
        let pushed = self.producer.push_slice(block);
        let dropped = (block.len() - pushed) as u64;
        if dropped == 0 {
            return;
        }

        self.overrun_count += dropped;
        self.samples_since_overrun_log += dropped;
        // Rate-limited: ~once per second at 44.1kHz
        if self.samples_since_overrun_log >= 44100 {
            debug!(
                dropped = self.overrun_count,
                "output tap full, nobody is reading"
            );
            self.samples_since_overrun_log = 0;
        }
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }
}

/// Read side of the rendered-output tap
pub struct TapReader {
    consumer: RbConsumer<f32>,
}

impl TapReader {
    /// Check how many samples are available
    #[inline]
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Pop up to `out.len()` samples, returning how many were read
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.consumer.pop_slice(out)
    }

    /// Discard everything buffered so far
    pub fn clear(&mut self) {
        let stale = self.consumer.occupied_len();
        self.consumer.skip(stale);
    }
}

/// [`AnalyserSource`] over the chain runtime's output.
///
/// Like a browser audio engine, there is nothing to analyse until playback
/// has started, so `connect` fails until the transport has moved.
pub struct TapSource {
    reader: TapReader,
    transport: Transport,
    settings: Settings,
    analyser: Option<Analyser>,
    scratch: Vec<f32>,
}

impl TapSource {
    pub fn new(reader: TapReader, transport: Transport, settings: &Settings) -> Self {
        Self {
            reader,
            transport,
            settings: settings.clone(),
            analyser: None,
            scratch: vec![0.0; DRAIN_CHUNK],
        }
    }
}

impl AnalyserSource for TapSource {
    fn connect(&mut self) -> bool {
        if self.transport.samples() == 0 {
            return false;
        }
        // Start from fresh audio, not whatever piled up before connecting
        self.reader.clear();
        self.analyser = Some(Analyser::from_settings(&self.settings));
        true
    }

    fn disconnect(&mut self) {
        self.analyser = None;
    }

    fn analyser(&mut self) -> Option<&mut dyn AnalyserNode> {
        let analyser = self.analyser.as_mut()?;
        loop {
            let read = self.reader.read(&mut self.scratch);
            if read == 0 {
                break;
            }
            analyser.push_samples(&self.scratch[..read]);
        }
        Some(analyser)
    }
}
