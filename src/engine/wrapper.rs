use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info};

use super::buffer_bridge::OutputTap;
use super::graph::{Graph, RenderContext};
use super::param_injector::{ParamInjector, PARAM_NAMES};
use super::parser::parse;
use super::{Transport, BLOCK_SIZE};
use crate::analysis::AudioFrame;
use crate::config::Settings;
use crate::error::RuntimeFault;
use crate::runtime::{ParamFault, Runtime};

/// Upper bound on blocks rendered by one `advance` call (~3s at 44.1kHz).
/// A stalled caller skips ahead instead of rendering a backlog.
const MAX_BLOCKS_PER_ADVANCE: usize = 1024;

/// Chain runtime: evaluation, hot-swapping and block rendering.
///
/// Failed evaluations leave the previous graph running.
pub struct ChainRuntime {
    sample_rate: f32,
    transport: Transport,
    graph: Option<Graph>,
    code: Option<String>,
    injector: ParamInjector,
    tap: Option<OutputTap>,
    block: [f32; BLOCK_SIZE],
    /// Fractional samples carried between `advance` calls
    carry: f64,
    faults: Vec<ParamFault>,
    /// Faults already reported for the running code
    reported: HashSet<Option<String>>,
}

impl ChainRuntime {
    pub fn new(sample_rate: u32, bpm: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f32,
            transport: Transport::new(sample_rate, bpm),
            graph: None,
            code: None,
            injector: ParamInjector::new(),
            tap: None,
            block: [0.0; BLOCK_SIZE],
            carry: 0.0,
            faults: Vec::new(),
            reported: HashSet::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.sample_rate, settings.bpm)
    }

    /// Copy every rendered block into `tap`
    pub fn with_tap(mut self, tap: OutputTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    /// The user code of the graph currently rendering
    pub fn running_code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The most recently rendered block
    pub fn last_block(&self) -> &[f32] {
        &self.block
    }

    /// Render `blocks` blocks and move the transport forward.
    pub fn render_blocks(&mut self, blocks: usize) {
        for _ in 0..blocks {
            match self.graph.as_mut() {
                Some(graph) => {
                    let ctx = RenderContext {
                        block_start: self.transport.samples(),
                        samples_per_cycle: self.transport.samples_per_cycle(),
                        params: &self.injector,
                    };
                    let mut faults = Vec::new();
                    graph.render(&ctx, &mut self.block, &mut faults);
                    for fault in faults {
                        // One report per parameter until the code changes
                        if self.reported.insert(fault.param_name.clone()) {
                            self.faults.push(fault);
                        }
                    }
                }
                None => self.block.fill(0.0),
            }
            if let Some(tap) = self.tap.as_mut() {
                tap.push_block(&self.block);
            }
            self.transport.advance(BLOCK_SIZE as u64);
        }
    }
}

impl Runtime for ChainRuntime {
    fn evaluate(&mut self, code: &str) -> Result<(), RuntimeFault> {
        let injected = self.injector.inject(code);
        let program = parse(&injected).map_err(RuntimeFault::from)?;
        let graph = Graph::compile(&program, self.sample_rate, PARAM_NAMES)?;

        debug!(chains = ?graph.chain_names().collect::<Vec<_>>(), "graph compiled");
        self.graph = Some(graph);
        self.code = Some(code.to_string());
        self.reported.clear();
        info!("code updated");
        Ok(())
    }

    fn soft_reset(&mut self) {
        self.transport.reset();
        self.carry = 0.0;
        if let Some(graph) = self.graph.as_mut() {
            graph.reset();
        }
    }

    fn on_audio(&mut self, frame: &AudioFrame) {
        self.injector.update_from_frame(frame);
    }

    fn advance(&mut self, elapsed: Duration) {
        self.carry += elapsed.as_secs_f64() * self.sample_rate as f64;
        let due = (self.carry / BLOCK_SIZE as f64).floor();
        self.carry -= due * BLOCK_SIZE as f64;
        let blocks = due as usize;
        if blocks > MAX_BLOCKS_PER_ADVANCE {
            debug!(blocks, "render backlog skipped");
        }
        self.render_blocks(blocks.min(MAX_BLOCKS_PER_ADVANCE));
    }

    fn poll_faults(&mut self) -> Vec<ParamFault> {
        std::mem::take(&mut self.faults)
    }
}
