//! Real-time pattern highlighting
//!
//! Once per animation frame the highlighter reads the virtual clock, queries
//! the active pattern over `[cycle - 1, cycle + lookahead)` and reconciles the
//! editor's decorations so that exactly the source ranges of haps covering
//! the current cycle are highlighted.

use std::collections::HashMap;

use tracing::debug;

use crate::config::MAX_LOOKAHEAD_CYCLES;
use crate::editor::{DecorationId, DecorationStyle, Editor};
use crate::pattern::{CycleClock, Location, Pattern};

/// Locations starting at offset 0 no longer than this are instrumentation
/// artifacts, not user source.
pub const ARTIFACT_SPAN_MAX: usize = 2;

fn is_artifact(location: &Location) -> bool {
    location.start == 0 && location.end.saturating_sub(location.start) <= ARTIFACT_SPAN_MAX
}

/// Characters `start..end` of `text`, if it is that long
fn char_range(text: &str, start: usize, end: usize) -> Option<&str> {
    let mut offsets = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()));
    let from = offsets.nth(start)?;
    let to = offsets.nth(end.checked_sub(start + 1)?)?;
    Some(&text[from..to])
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDecoration {
    pub key: String,
    pub handle: DecorationId,
    pub hap_end: f64,
}

/// Winner for one key in a frame: the hap with the latest end
struct Candidate {
    location: Location,
    hap_end: f64,
    color: Option<String>,
}

pub struct PatternHighlighter {
    pattern: Option<Box<dyn Pattern>>,
    clock: Option<Box<dyn CycleClock>>,
    /// Text the pattern's locations index into
    source: Option<String>,
    lookahead: f64,
    running: bool,
    active: HashMap<String, ActiveDecoration>,
}

impl PatternHighlighter {
    pub fn new(lookahead: f64) -> Self {
        Self {
            pattern: None,
            clock: None,
            source: None,
            lookahead: lookahead.max(0.0).min(MAX_LOOKAHEAD_CYCLES),
            running: false,
            active: HashMap::new(),
        }
    }

    /// Replace the pattern and clock. Existing decorations are cleared since
    /// their offsets referred to the previous pattern's source.
    pub fn set_pattern(
        &mut self,
        editor: &mut dyn Editor,
        pattern: Box<dyn Pattern>,
        clock: Box<dyn CycleClock>,
    ) {
        self.clear(editor);
        self.pattern = Some(pattern);
        self.clock = Some(clock);
        self.source = None;
    }

    /// Record the text the current pattern was derived from. From then on a
    /// range is only highlighted while the editor still shows the same text
    /// there, so edits made after the pattern was installed never get a
    /// highlight meant for different code.
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn has_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop updating and clear every decoration. Safe to call repeatedly.
    pub fn stop(&mut self, editor: &mut dyn Editor) {
        self.running = false;
        self.clear(editor);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Keys of the ranges currently highlighted, sorted
    pub fn active_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.active.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn active(&self, key: &str) -> Option<&ActiveDecoration> {
        self.active.get(key)
    }

    fn clear(&mut self, editor: &mut dyn Editor) {
        for (_, decoration) in self.active.drain() {
            editor.remove_decoration(decoration.handle);
        }
    }

    /// One animation-frame update.
    pub fn frame(&mut self, editor: &mut dyn Editor) {
        if !self.running {
            return;
        }
        let (Some(pattern), Some(clock)) = (self.pattern.as_ref(), self.clock.as_ref()) else {
            return;
        };

        let cycle = clock.cycle();
        let haps = match pattern.query_arc(cycle - 1.0, cycle + self.lookahead) {
            Ok(haps) => haps,
            Err(err) => {
                debug!(%err, cycle, "pattern query failed, skipping frame");
                return;
            }
        };

        let mut wanted: HashMap<String, Candidate> = HashMap::new();
        for hap in haps.iter().filter(|hap| hap.covers(cycle)) {
            for location in hap.locations.iter().filter(|l| !is_artifact(l)) {
                let candidate = Candidate {
                    location: *location,
                    hap_end: hap.end,
                    color: hap.color.clone(),
                };
                wanted
                    .entry(location.key())
                    .and_modify(|existing| {
                        if hap.end > existing.hap_end {
                            *existing = Candidate {
                                location: *location,
                                hap_end: hap.end,
                                color: hap.color.clone(),
                            };
                        }
                    })
                    .or_insert(candidate);
            }
        }

        self.active.retain(|key, decoration| {
            let keep = wanted.contains_key(key);
            if !keep {
                editor.remove_decoration(decoration.handle);
            }
            keep
        });

        let current = match (&self.source, wanted.is_empty()) {
            (Some(_), false) => Some(editor.value()),
            _ => None,
        };

        for (key, candidate) in wanted {
            if let Some(existing) = self.active.get_mut(&key) {
                existing.hap_end = candidate.hap_end;
                continue;
            }

            let Location { start, end } = candidate.location;
            if start >= end {
                continue;
            }
            if let (Some(source), Some(current)) = (&self.source, &current) {
                let expected = char_range(source, start, end);
                if expected.is_none() || expected != char_range(current, start, end) {
                    continue;
                }
            }
            // Offsets past the end of the current text are stale; skip them
            let (Some(from), Some(to)) = (editor.position_at(start), editor.position_at(end))
            else {
                continue;
            };
            let style = DecorationStyle {
                color: candidate.color,
            };
            let handle = editor.add_decoration(from, to, &style);
            self.active.insert(
                key.clone(),
                ActiveDecoration {
                    key,
                    handle,
                    hap_end: candidate.hap_end,
                },
            );
        }
    }
}
