//! Audio analysis bridge
//!
//! Decouples audio-reactive consumers from whichever engine produces sound.
//! Once per frame the bridge pulls fixed-size frequency and waveform buffers
//! from the current source's analyser and fans an immutable snapshot out to
//! every subscriber.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

use crate::timer::Millis;

/// Queued snapshots per subscriber before frames start getting dropped
const SUBSCRIBER_QUEUE: usize = 4;

/// One analyser snapshot. `fft` has `fft_size / 2` bins, `waveform` has `fft_size` samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioFrame {
    pub fft: Vec<u8>,
    pub waveform: Vec<u8>,
    pub timestamp: f64,
}

impl AudioFrame {
    /// Mean of the waveform's absolute deviation from center, 0.0..1.0
    pub fn level(&self) -> f32 {
        if self.waveform.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .waveform
            .iter()
            .map(|&b| ((b as f32 - 128.0) / 128.0).powi(2))
            .sum();
        (sum / self.waveform.len() as f32).sqrt()
    }

    /// Mean bin energy over `range` (fractions of the spectrum), 0.0..1.0
    pub fn band(&self, from: f32, to: f32) -> f32 {
        let len = self.fft.len();
        let start = ((from * len as f32) as usize).min(len);
        let end = ((to * len as f32) as usize).clamp(start, len);
        if start == end {
            return 0.0;
        }
        let sum: u32 = self.fft[start..end].iter().map(|&b| b as u32).sum();
        sum as f32 / ((end - start) as f32 * 255.0)
    }
}

pub trait AnalyserNode {
    fn fft_size(&self) -> usize;

    /// Fill `out` with frequency-domain bytes (`fft_size / 2` bins)
    fn fill_frequency(&mut self, out: &mut [u8]);

    /// Fill `out` with time-domain bytes (`fft_size` samples)
    fn fill_waveform(&mut self, out: &mut [u8]);
}

/// Adapter over an audio engine that may or may not have an analyser yet.
pub trait AnalyserSource {
    /// Try to attach to the engine's analyser. Engines often expose it only
    /// once playback has started, so `false` is a normal answer.
    fn connect(&mut self) -> bool;

    fn disconnect(&mut self);

    fn analyser(&mut self) -> Option<&mut dyn AnalyserNode>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    sender: Sender<Arc<AudioFrame>>,
}

pub struct AudioBridge {
    source: Option<Box<dyn AnalyserSource>>,
    connected: bool,
    polling: bool,
    fft: Vec<u8>,
    waveform: Vec<u8>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl Default for AudioBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBridge {
    pub fn new() -> Self {
        Self {
            source: None,
            connected: false,
            polling: false,
            fft: Vec::new(),
            waveform: Vec::new(),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    /// Replace the source, disconnecting the previous one.
    pub fn set_source(&mut self, source: Box<dyn AnalyserSource>) {
        self.clear_source();
        self.source = Some(source);
    }

    pub fn clear_source(&mut self) {
        if let Some(mut old) = self.source.take() {
            old.disconnect();
        }
        self.connected = false;
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Begin polling on each `frame` call.
    pub fn start(&mut self) {
        self.polling = true;
    }

    /// Stop polling and disconnect. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.polling = false;
        self.clear_source();
    }

    pub fn subscribe(&mut self) -> (SubscriptionId, Receiver<Arc<AudioFrame>>) {
        let (sender, receiver) = bounded(SUBSCRIBER_QUEUE);
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, sender });
        (id, receiver)
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Poll the analyser once and publish the snapshot.
    ///
    /// Returns the published frame so the caller can also forward it across
    /// a sandbox channel at the same cadence.
    pub fn frame(&mut self, now: Millis) -> Option<Arc<AudioFrame>> {
        if !self.polling {
            return None;
        }
        let source = self.source.as_mut()?;

        if !self.connected {
            self.connected = source.connect();
            if !self.connected {
                return None;
            }
            debug!("audio bridge connected to analyser");
        }

        let Some(analyser) = source.analyser() else {
            // Engine tore its analyser down; reconnect on a later frame
            self.connected = false;
            return None;
        };

        let size = analyser.fft_size();
        self.fft.resize(size / 2, 0);
        self.waveform.resize(size, 128);
        analyser.fill_frequency(&mut self.fft);
        analyser.fill_waveform(&mut self.waveform);

        let snapshot = Arc::new(AudioFrame {
            fft: self.fft.clone(),
            waveform: self.waveform.clone(),
            timestamp: now as f64,
        });

        self.subscribers.retain(|s| match s.sender.try_send(Arc::clone(&snapshot)) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });

        Some(snapshot)
    }
}
