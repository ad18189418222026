//! Host-side executor for the audio runtime.
//!
//! Audio runs in-process rather than behind the sandbox channel, so results
//! are queued as [`RunSignal`]s and drained by the session once per frame.
//! Nothing renders until audio has been unlocked by a user interaction.

use std::collections::VecDeque;

use tracing::debug;

use super::buffer_bridge::{output_tap, TapSource};
use super::wrapper::ChainRuntime;
use super::{Transport, BLOCK_SIZE};
use crate::config::Settings;
use crate::controller::Executor;
use crate::error::RuntimeFault;
use crate::runtime::{ParamFault, Runtime};
use crate::timer::Millis;

/// Most blocks rendered in one `render_until` call before re-anchoring the clock
const MAX_CATCHUP_BLOCKS: u64 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum RunSignal {
    /// `code` is what was evaluated, which may differ from the latest request
    /// once the queue holds more than one result.
    Ok { timestamp: f64, code: String },
    Error(RuntimeFault),
    Param(ParamFault),
}

pub struct LocalExecutor {
    runtime: ChainRuntime,
    signals: VecDeque<RunSignal>,
    unlocked: bool,
    /// Wall time and transport position rendering is measured from
    anchor: Option<(Millis, u64)>,
}

impl LocalExecutor {
    pub fn new(runtime: ChainRuntime) -> Self {
        Self {
            runtime,
            signals: VecDeque::new(),
            unlocked: false,
            anchor: None,
        }
    }

    /// Executor plus an analyser source over its rendered output
    pub fn from_settings(settings: &Settings) -> (Self, TapSource) {
        let (tap, reader) = output_tap();
        let runtime = ChainRuntime::from_settings(settings).with_tap(tap);
        let source = TapSource::new(reader, runtime.transport(), settings);
        (Self::new(runtime), source)
    }

    pub fn transport(&self) -> Transport {
        self.runtime.transport()
    }

    pub fn runtime(&self) -> &ChainRuntime {
        &self.runtime
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn drain_signals(&mut self) -> Vec<RunSignal> {
        self.signals.drain(..).collect()
    }

    /// Render whatever audio is due at wall time `now`.
    pub fn render_until(&mut self, now: Millis) {
        if !self.unlocked {
            return;
        }
        let transport = self.runtime.transport();
        let (start_ms, start_samples) = *self
            .anchor
            .get_or_insert((now, transport.samples()));

        let elapsed = now.saturating_sub(start_ms);
        let target = start_samples + elapsed * transport.sample_rate() as u64 / 1000;
        let due = target.saturating_sub(transport.samples()) / BLOCK_SIZE as u64;

        if due > MAX_CATCHUP_BLOCKS {
            debug!(due, "audio fell behind, skipping ahead");
            self.runtime.render_blocks(MAX_CATCHUP_BLOCKS as usize);
            self.anchor = Some((now, transport.samples()));
        } else {
            self.runtime.render_blocks(due as usize);
        }

        self.signals
            .extend(self.runtime.poll_faults().into_iter().map(RunSignal::Param));
    }
}

impl Executor for LocalExecutor {
    fn execute(&mut self, code: &str) {
        let signal = match self.runtime.evaluate(code) {
            Ok(()) => RunSignal::Ok {
                timestamp: self.runtime.transport().millis(),
                code: code.to_string(),
            },
            Err(fault) => RunSignal::Error(fault),
        };
        self.signals.push_back(signal);
    }

    fn soft_reset(&mut self, code: &str) {
        self.runtime.soft_reset();
        self.anchor = None;
        self.execute(code);
    }

    fn init_audio(&mut self) -> bool {
        if !self.unlocked {
            debug!("audio unlocked");
        }
        self.unlocked = true;
        true
    }

    fn requires_unlock(&self) -> bool {
        true
    }
}
