//! Time-indexed patterns
//!
//! A [`Pattern`] is queried over a window of cycles and returns the haps
//! (events) overlapping it. Patterns hold no time state; the caller owns the
//! clock and picks the window.

use crate::engine::parser::{self, parse_step, Slot};
use crate::error::PatternError;

/// Reads the virtual clock, in cycles.
pub trait CycleClock {
    fn cycle(&self) -> f64;
}

impl<F: Fn() -> f64> CycleClock for F {
    fn cycle(&self) -> f64 {
        self()
    }
}

/// Character range `[start, end)` in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub start: usize,
    pub end: usize,
}

impl Location {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Decoration key, `"start:end"`
    pub fn key(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }
}

/// An event active over `[begin, end)` cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct Hap {
    pub begin: f64,
    pub end: f64,
    pub locations: Vec<Location>,
    pub color: Option<String>,
}

impl Hap {
    pub fn new(begin: f64, end: f64) -> Self {
        Self {
            begin,
            end,
            locations: Vec::new(),
            color: None,
        }
    }

    pub fn with_location(mut self, start: usize, end: usize) -> Self {
        self.locations.push(Location::new(start, end));
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// `cycle` lies in `[begin, end)`
    pub fn covers(&self, cycle: f64) -> bool {
        self.begin <= cycle && cycle < self.end
    }
}

pub trait Pattern {
    /// Haps overlapping `[begin, end)`.
    fn query_arc(&self, begin: f64, end: f64) -> Result<Vec<Hap>, PatternError>;
}

impl<F> Pattern for F
where
    F: Fn(f64, f64) -> Result<Vec<Hap>, PatternError>,
{
    fn query_arc(&self, begin: f64, end: f64) -> Result<Vec<Hap>, PatternError> {
        self(begin, end)
    }
}

pub fn check_window(begin: f64, end: f64) -> Result<(), PatternError> {
    if !begin.is_finite() || !end.is_finite() || begin > end {
        return Err(PatternError::InvalidWindow { begin, end });
    }
    Ok(())
}

/// A step of a `seq`: its sub-slots, each a note location or a rest
type Step = Vec<Option<Location>>;

/// The sounding steps of every `seq` node in a piece of chain code.
///
/// Each `seq` divides a cycle evenly between its steps, and each step
/// divides its share between sub-slots (`_60` is a rest then a note).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeqPattern {
    sequences: Vec<Vec<Step>>,
}

impl SeqPattern {
    pub fn from_code(code: &str) -> Result<Self, PatternError> {
        let program = parser::parse(code).map_err(|e| PatternError::Query(e.to_string()))?;

        let mut sequences = Vec::new();
        for node in program.chains.iter().flat_map(|c| c.nodes.iter()) {
            if node.name.text != "seq" {
                continue;
            }
            let steps = node
                .args
                .iter()
                .map(|token| {
                    let slots = parse_step(token).ok_or_else(|| {
                        PatternError::Query(format!("invalid step `{}`", token.text))
                    })?;
                    Ok(slots
                        .into_iter()
                        .map(|slot| match slot {
                            Slot::Rest => None,
                            Slot::Note { start, end, .. } => Some(Location::new(start, end)),
                        })
                        .collect())
                })
                .collect::<Result<Vec<Step>, PatternError>>()?;
            if !steps.is_empty() {
                sequences.push(steps);
            }
        }
        Ok(Self { sequences })
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl Pattern for SeqPattern {
    fn query_arc(&self, begin: f64, end: f64) -> Result<Vec<Hap>, PatternError> {
        check_window(begin, end)?;
        let mut haps = Vec::new();
        if begin == end {
            return Ok(haps);
        }

        for cycle in (begin.floor() as i64)..=(end.ceil() as i64) {
            let base = cycle as f64;
            for steps in &self.sequences {
                let step_len = 1.0 / steps.len() as f64;
                for (i, slots) in steps.iter().enumerate() {
                    let slot_len = step_len / slots.len() as f64;
                    for (j, slot) in slots.iter().enumerate() {
                        let Some(location) = slot else {
                            continue;
                        };
                        let hap_begin = base + i as f64 * step_len + j as f64 * slot_len;
                        let hap_end = hap_begin + slot_len;
                        if hap_end > begin && hap_begin < end {
                            haps.push(
                                Hap::new(hap_begin, hap_end)
                                    .with_location(location.start, location.end),
                            );
                        }
                    }
                }
            }
        }
        Ok(haps)
    }
}
