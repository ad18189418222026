//! Compiled chain graph
//!
//! A [`Program`] is compiled into per-chain node lists, checked for undefined
//! and circular references, and rendered one block at a time in dependency
//! order. `out` is the audible chain.

use std::collections::HashMap;
use std::f32::consts::TAU;

use super::parser::{parse_step, ChainDef, NodeDef, Program, Slot, Token};
use super::BLOCK_SIZE;
use crate::dsp::delay::Delay;
use crate::dsp::filter::{Biquad, FilterKind};
use crate::dsp::{mtof, Processor};
use crate::error::RuntimeFault;
use crate::runtime::ParamFault;

type Block = [f32; BLOCK_SIZE];

/// Values the `param` node reads every block.
pub trait ParamSource {
    fn param(&self, name: &str) -> Option<f32>;
}

pub struct RenderContext<'a> {
    /// Transport position of the first sample in the block
    pub block_start: u64,
    pub samples_per_cycle: f64,
    pub params: &'a dyn ParamSource,
}

#[derive(Debug, Clone, Copy)]
enum Value {
    Const(f32),
    Chain(usize),
}

impl Value {
    #[inline]
    fn at(self, buffers: &[Block], i: usize) -> f32 {
        match self {
            Value::Const(v) => v,
            Value::Chain(index) => buffers[index][i],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Sine,
    Saw,
    Square,
    Triangle,
}

impl Shape {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Shape::Sine),
            "saw" => Some(Shape::Saw),
            "squ" => Some(Shape::Square),
            "tri" => Some(Shape::Triangle),
            _ => None,
        }
    }

    /// `phase` in 0..1
    fn sample(self, phase: f32) -> f32 {
        match self {
            Shape::Sine => (TAU * phase).sin(),
            Shape::Saw => 2.0 * phase - 1.0,
            Shape::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Shape::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

const NOISE_SEED: u32 = 0x9E37_79B9;

enum Node {
    /// `freq: None` follows the incoming signal as frequency
    Osc {
        shape: Shape,
        freq: Option<Value>,
        phase: f32,
    },
    Noise {
        seed: u32,
        state: u32,
    },
    Sig(Value),
    /// Frequencies per step and sub-slot; `None` is a rest
    Seq(Vec<Vec<Option<f32>>>),
    Param(String),
    Ref(usize),
    Mul(Value),
    Add(Value),
    Filter {
        filter: Biquad,
        cutoff: Value,
        q: f32,
    },
    Delay(Delay),
}

impl Node {
    fn process(
        &mut self,
        block: &mut Block,
        buffers: &[Block],
        ctx: &RenderContext<'_>,
        sample_rate: f32,
        faults: &mut Vec<ParamFault>,
    ) {
        match self {
            Node::Osc { shape, freq, phase } => {
                for (i, sample) in block.iter_mut().enumerate() {
                    let hz = freq.map_or(*sample, |v| v.at(buffers, i));
                    *sample = shape.sample(*phase);
                    *phase = (*phase + hz / sample_rate).rem_euclid(1.0);
                    if !phase.is_finite() {
                        *phase = 0.0;
                    }
                }
            }
            Node::Noise { state, .. } => {
                for sample in block.iter_mut() {
                    // xorshift32
                    *state ^= *state << 13;
                    *state ^= *state >> 17;
                    *state ^= *state << 5;
                    *sample = *state as f32 / u32::MAX as f32 * 2.0 - 1.0;
                }
            }
            Node::Sig(value) => {
                for (i, sample) in block.iter_mut().enumerate() {
                    *sample = value.at(buffers, i);
                }
            }
            Node::Seq(steps) => {
                let count = steps.len() as f64;
                for (i, sample) in block.iter_mut().enumerate() {
                    let position = (ctx.block_start + i as u64) as f64 / ctx.samples_per_cycle;
                    let scaled = position.fract() * count;
                    let step = (scaled as usize).min(steps.len() - 1);
                    let slots = &steps[step];
                    let local = scaled - step as f64;
                    let slot = ((local * slots.len() as f64) as usize).min(slots.len() - 1);
                    *sample = slots[slot].unwrap_or(0.0);
                }
            }
            Node::Param(name) => {
                let value = ctx.params.param(name).unwrap_or(0.0);
                let value = if value.is_finite() {
                    value
                } else {
                    faults.push(ParamFault {
                        message: format!("parameter `~{name}` is not a finite number"),
                        param_name: Some(name.clone()),
                    });
                    0.0
                };
                block.fill(value);
            }
            Node::Ref(index) => *block = buffers[*index],
            Node::Mul(value) => {
                for (i, sample) in block.iter_mut().enumerate() {
                    *sample *= value.at(buffers, i);
                }
            }
            Node::Add(value) => {
                for (i, sample) in block.iter_mut().enumerate() {
                    *sample += value.at(buffers, i);
                }
            }
            Node::Filter { filter, cutoff, q } => {
                filter.set(cutoff.at(buffers, 0), *q);
                filter.process_block(block);
            }
            Node::Delay(delay) => delay.process_block(block),
        }
    }

    fn reset(&mut self) {
        match self {
            Node::Osc { phase, .. } => *phase = 0.0,
            Node::Noise { seed, state } => *state = *seed,
            Node::Filter { filter, .. } => filter.reset(),
            Node::Delay(delay) => delay.reset(),
            _ => {}
        }
    }

    fn dependency(&self) -> Vec<usize> {
        let value = match self {
            Node::Osc { freq: Some(v), .. } => *v,
            Node::Sig(v) | Node::Mul(v) | Node::Add(v) => *v,
            Node::Filter { cutoff, .. } => *cutoff,
            Node::Ref(index) => return vec![*index],
            _ => return Vec::new(),
        };
        match value {
            Value::Chain(index) => vec![index],
            Value::Const(_) => Vec::new(),
        }
    }
}

struct Chain {
    name: String,
    nodes: Vec<Node>,
}

pub struct Graph {
    chains: Vec<Chain>,
    order: Vec<usize>,
    out: usize,
    buffers: Vec<Block>,
    sample_rate: f32,
}

fn fault_at(token: &Token, message: impl Into<String>) -> RuntimeFault {
    RuntimeFault::new(message).at(token.span.line, token.span.column)
}

struct Compiler<'a> {
    names: HashMap<&'a str, usize>,
    sample_rate: f32,
    params: &'a [&'a str],
}

impl<'a> Compiler<'a> {
    fn reference(&self, token: &Token) -> Result<usize, RuntimeFault> {
        self.names
            .get(token.text.as_str())
            .copied()
            .ok_or_else(|| fault_at(token, format!("undefined reference `{}`", token.text)))
    }

    fn number(&self, token: &Token) -> Result<f32, RuntimeFault> {
        token
            .text
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| fault_at(token, format!("expected a number, found `{}`", token.text)))
    }

    fn value(&self, token: &Token) -> Result<Value, RuntimeFault> {
        if token.text.starts_with('~') {
            return self.reference(token).map(Value::Chain);
        }
        token
            .text
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Value::Const)
            .ok_or_else(|| {
                fault_at(
                    token,
                    format!("expected a number or `~reference`, found `{}`", token.text),
                )
            })
    }

    fn arity(node: &NodeDef, min: usize, max: usize) -> Result<(), RuntimeFault> {
        let count = node.args.len();
        if count < min || count > max {
            let expected = if min == max {
                format!("{min}")
            } else if max == usize::MAX {
                format!("at least {min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(fault_at(
                &node.name,
                format!(
                    "`{}` takes {expected} argument(s), got {count}",
                    node.name.text
                ),
            ));
        }
        Ok(())
    }

    fn position(node: &NodeDef, first: bool, source: bool) -> Result<(), RuntimeFault> {
        match (first, source) {
            (true, false) => Err(fault_at(
                &node.name,
                format!("`{}` needs an input and cannot start a chain", node.name.text),
            )),
            (false, true) => Err(fault_at(
                &node.name,
                format!("`{}` must start a chain", node.name.text),
            )),
            _ => Ok(()),
        }
    }

    fn node(&self, node: &NodeDef, first: bool) -> Result<Node, RuntimeFault> {
        let name = node.name.text.as_str();

        if let Some(shape) = Shape::from_name(name) {
            Self::arity(node, 0, 1)?;
            let freq = node.args.first().map(|t| self.value(t)).transpose()?;
            if first && freq.is_none() {
                return Err(fault_at(
                    &node.name,
                    format!("`{name}` needs a frequency when it starts a chain"),
                ));
            }
            return Ok(Node::Osc {
                shape,
                freq,
                phase: 0.0,
            });
        }

        if name.starts_with('~') {
            Self::position(node, first, true)?;
            Self::arity(node, 0, 0)?;
            return self.reference(&node.name).map(Node::Ref);
        }

        match name {
            "noise" => {
                Self::position(node, first, true)?;
                Self::arity(node, 0, 1)?;
                let seed = match node.args.first() {
                    Some(t) => self.number(t)? as u32 | 1,
                    None => NOISE_SEED,
                };
                Ok(Node::Noise { seed, state: seed })
            }
            "sig" => {
                Self::position(node, first, true)?;
                Self::arity(node, 1, 1)?;
                Ok(Node::Sig(self.value(&node.args[0])?))
            }
            "seq" => {
                Self::position(node, first, true)?;
                Self::arity(node, 1, usize::MAX)?;
                let steps = node
                    .args
                    .iter()
                    .map(|token| {
                        let slots = parse_step(token).ok_or_else(|| {
                            fault_at(token, format!("invalid step `{}`", token.text))
                        })?;
                        Ok(slots
                            .into_iter()
                            .map(|slot| match slot {
                                Slot::Rest => None,
                                Slot::Note { note, .. } => Some(mtof(note as f32)),
                            })
                            .collect())
                    })
                    .collect::<Result<Vec<_>, RuntimeFault>>()?;
                Ok(Node::Seq(steps))
            }
            "param" => {
                Self::position(node, first, true)?;
                Self::arity(node, 1, 1)?;
                let param = &node.args[0];
                if !self.params.contains(&param.text.as_str()) {
                    return Err(fault_at(
                        param,
                        format!("unknown parameter `{}`", param.text),
                    ));
                }
                Ok(Node::Param(param.text.clone()))
            }
            "mul" | "add" => {
                Self::position(node, first, false)?;
                Self::arity(node, 1, 1)?;
                let value = self.value(&node.args[0])?;
                Ok(if name == "mul" {
                    Node::Mul(value)
                } else {
                    Node::Add(value)
                })
            }
            "lpf" | "hpf" => {
                Self::position(node, first, false)?;
                Self::arity(node, 1, 2)?;
                let kind = if name == "lpf" {
                    FilterKind::LowPass
                } else {
                    FilterKind::HighPass
                };
                let cutoff = self.value(&node.args[0])?;
                let q = match node.args.get(1) {
                    Some(t) => self.number(t)?,
                    None => std::f32::consts::FRAC_1_SQRT_2,
                };
                Ok(Node::Filter {
                    filter: Biquad::new(kind, self.sample_rate),
                    cutoff,
                    q,
                })
            }
            "delayms" => {
                Self::position(node, first, false)?;
                Self::arity(node, 1, 2)?;
                let mut delay = Delay::new(self.sample_rate);
                delay.set_time_ms(self.number(&node.args[0])?);
                if let Some(t) = node.args.get(1) {
                    delay.set_feedback(self.number(t)?);
                }
                Ok(Node::Delay(delay))
            }
            _ => Err(fault_at(&node.name, format!("unknown node `{name}`"))),
        }
    }

    fn chain(&self, def: &ChainDef) -> Result<Chain, RuntimeFault> {
        let nodes = def
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| self.node(node, i == 0))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Chain {
            name: def.name.text.clone(),
            nodes,
        })
    }
}

/// Depth-first topological order; errors on the first cycle found.
fn dependency_order(chains: &[Chain], defs: &[ChainDef]) -> Result<Vec<usize>, RuntimeFault> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        index: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        order: &mut Vec<usize>,
        defs: &[ChainDef],
    ) -> Result<(), RuntimeFault> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(fault_at(
                    &defs[index].name,
                    format!("circular reference involving `{}`", defs[index].name.text),
                ))
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::Visiting;
        for &dep in &deps[index] {
            visit(dep, deps, marks, order, defs)?;
        }
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    let deps: Vec<Vec<usize>> = chains
        .iter()
        .map(|c| c.nodes.iter().flat_map(Node::dependency).collect())
        .collect();
    let mut marks = vec![Mark::Unvisited; chains.len()];
    let mut order = Vec::with_capacity(chains.len());
    for index in 0..chains.len() {
        visit(index, &deps, &mut marks, &mut order, defs)?;
    }
    Ok(order)
}

impl Graph {
    /// Compile a parsed program. `params` names the values `param` may read.
    pub fn compile(
        program: &Program,
        sample_rate: f32,
        params: &[&str],
    ) -> Result<Self, RuntimeFault> {
        let mut names = HashMap::new();
        for (index, def) in program.chains.iter().enumerate() {
            if names.insert(def.name.text.as_str(), index).is_some() {
                return Err(fault_at(
                    &def.name,
                    format!("chain `{}` is defined twice", def.name.text),
                ));
            }
        }
        let out = *names
            .get("out")
            .ok_or_else(|| RuntimeFault::new("no `out:` chain").at(1, 1))?;

        let compiler = Compiler {
            names,
            sample_rate,
            params,
        };
        let chains = program
            .chains
            .iter()
            .map(|def| compiler.chain(def))
            .collect::<Result<Vec<_>, _>>()?;
        let order = dependency_order(&chains, &program.chains)?;

        Ok(Self {
            buffers: vec![[0.0; BLOCK_SIZE]; chains.len()],
            chains,
            order,
            out,
            sample_rate,
        })
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.iter().map(|c| c.name.as_str())
    }

    /// Render one block of `out`. Chains producing non-finite samples are
    /// silenced for the block and reported in `faults`.
    pub fn render(&mut self, ctx: &RenderContext<'_>, out: &mut Block, faults: &mut Vec<ParamFault>) {
        let Graph {
            chains,
            order,
            out: out_index,
            buffers,
            sample_rate,
        } = self;

        for &index in order.iter() {
            let mut block = [0.0; BLOCK_SIZE];
            let chain = &mut chains[index];
            for node in chain.nodes.iter_mut() {
                node.process(&mut block, buffers, ctx, *sample_rate, faults);
            }
            if block.iter().any(|s| !s.is_finite()) {
                block = [0.0; BLOCK_SIZE];
                let name = chain.name.trim_start_matches('~').to_string();
                faults.push(ParamFault {
                    message: format!("`{}` produced a non-finite value", chain.name),
                    param_name: Some(name),
                });
            }
            buffers[index] = block;
        }
        *out = buffers[*out_index];
    }

    /// Clear oscillator phases, filter history and delay lines.
    pub fn reset(&mut self) {
        for chain in self.chains.iter_mut() {
            for node in chain.nodes.iter_mut() {
                node.reset();
            }
        }
        for buffer in self.buffers.iter_mut() {
            buffer.fill(0.0);
        }
    }
}
