//! The editor surface the pipeline drives.
//!
//! The pipeline never owns a widget. It reads and writes text, places error
//! markers, and adds or removes transient highlight decorations through the
//! [`Editor`] trait. [`TextModel`] is a headless implementation used by the
//! session in tests and by embedders without a real widget.

use std::collections::BTreeMap;

/// 1-based line/column position in the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A diagnostic shown in the editor gutter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub position: Position,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecorationId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecorationStyle {
    pub color: Option<String>,
}

pub trait Editor {
    fn value(&self) -> String;

    fn set_value(&mut self, text: &str);

    fn set_markers(&mut self, markers: &[Marker]);

    fn clear_markers(&mut self);

    /// Convert a character offset into a position, or `None` if the offset is
    /// past the end of the document.
    fn position_at(&self, offset: usize) -> Option<Position>;

    /// Highlight `[from, to)`. The decoration follows later edits.
    fn add_decoration(&mut self, from: Position, to: Position, style: &DecorationStyle)
        -> DecorationId;

    fn remove_decoration(&mut self, id: DecorationId);
}

#[derive(Debug, Clone, PartialEq)]
struct Decoration {
    start: usize,
    end: usize,
    style: DecorationStyle,
}

/// Headless text model with markers and edit-tracking decorations.
#[derive(Debug, Default)]
pub struct TextModel {
    text: Vec<char>,
    markers: Vec<Marker>,
    decorations: BTreeMap<DecorationId, Decoration>,
    next_decoration: u64,
}

impl TextModel {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.chars().collect(),
            ..Self::default()
        }
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn decoration_count(&self) -> usize {
        self.decorations.len()
    }

    /// Text currently covered by each decoration, in creation order.
    pub fn decorated_text(&self) -> Vec<String> {
        self.decorations
            .values()
            .map(|d| self.text[d.start..d.end].iter().collect())
            .collect()
    }

    /// Replace the characters in `start..end` with `insert`, shifting
    /// decorations that sit after the edit. Decorations the edit swallows
    /// collapse to the edit point.
    pub fn replace_range(&mut self, start: usize, end: usize, insert: &str) {
        let start = start.min(self.text.len());
        let end = end.clamp(start, self.text.len());
        let inserted: Vec<char> = insert.chars().collect();
        let added = inserted.len();
        let removed = end - start;
        self.text.splice(start..end, inserted);

        let shift = |offset: usize| -> usize {
            if offset <= start {
                offset
            } else if offset >= end {
                offset - removed + added
            } else {
                start
            }
        };
        for deco in self.decorations.values_mut() {
            deco.start = shift(deco.start);
            deco.end = shift(deco.end).max(deco.start);
        }
    }

    fn offset_of(&self, position: Position) -> Option<usize> {
        let mut line = 1;
        let mut column = 1;
        for (offset, ch) in self.text.iter().enumerate() {
            if line == position.line && column == position.column {
                return Some(offset);
            }
            if *ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        (line == position.line && column == position.column).then_some(self.text.len())
    }
}

impl Editor for TextModel {
    fn value(&self) -> String {
        self.text.iter().collect()
    }

    fn set_value(&mut self, text: &str) {
        let len = self.text.len();
        self.replace_range(0, len, text);
    }

    fn set_markers(&mut self, markers: &[Marker]) {
        self.markers = markers.to_vec();
    }

    fn clear_markers(&mut self) {
        self.markers.clear();
    }

    fn position_at(&self, offset: usize) -> Option<Position> {
        if offset > self.text.len() {
            return None;
        }
        let mut line = 1;
        let mut column = 1;
        for ch in &self.text[..offset] {
            if *ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Some(Position::new(line, column))
    }

    fn add_decoration(
        &mut self,
        from: Position,
        to: Position,
        style: &DecorationStyle,
    ) -> DecorationId {
        let start = self.offset_of(from).unwrap_or(self.text.len());
        let end = self.offset_of(to).unwrap_or(self.text.len()).max(start);
        let id = DecorationId(self.next_decoration);
        self.next_decoration += 1;
        self.decorations.insert(
            id,
            Decoration {
                start,
                end,
                style: style.clone(),
            },
        );
        id
    }

    fn remove_decoration(&mut self, id: DecorationId) {
        self.decorations.remove(&id);
    }
}
