//! Parser for Glicol-style chain code
//!
//! ```text
//! ~mod: sin 0.5 >> mul 200 >> add 400
//! out: seq 60 _60 _ 67 >> saw >> lpf ~mod 2.0
//!     >> mul 0.3        // continuation lines start with `>>`
//! ```
//!
//! Each non-empty line defines a chain `name: node >> node ...`, where `name`
//! is `out` or `~ident`. Every token carries its character span so errors and
//! highlights can point back into the source.

use crate::error::RuntimeFault;

/// Character range in the whole source plus the 1-based line/column of its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDef {
    pub name: Token,
    pub args: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDef {
    pub name: Token,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    pub chains: Vec<ChainDef>,
}

impl Program {
    pub fn chain(&self, name: &str) -> Option<&ChainDef> {
        self.chains.iter().find(|c| c.name.text == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    fn at(span: Span, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: span.line,
            column: span.column,
        }
    }
}

impl From<ParseError> for RuntimeFault {
    fn from(err: ParseError) -> Self {
        RuntimeFault::new(err.message).at(err.line, err.column)
    }
}

/// One sub-slot of a `seq` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Rest,
    /// MIDI note, with the character span of its digits
    Note { note: u8, start: usize, end: usize },
}

/// Split a `seq` step such as `_60` or `60_62` into sub-slots.
///
/// Each `_` is a rest and each run of digits is a note (0..=127). Returns
/// `None` for anything else.
pub fn parse_step(token: &Token) -> Option<Vec<Slot>> {
    let chars: Vec<char> = token.text.chars().collect();
    if chars.is_empty() {
        return None;
    }

    let mut slots = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '_' {
            slots.push(Slot::Rest);
            i += 1;
        } else if chars[i].is_ascii_digit() {
            let from = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[from..i].iter().collect();
            let note: u8 = digits.parse().ok().filter(|n| *n <= 127)?;
            slots.push(Slot::Note {
                note,
                start: token.span.start + from,
                end: token.span.start + i,
            });
        } else {
            return None;
        }
    }
    Some(slots)
}

pub fn is_chain_name(text: &str) -> bool {
    if text == "out" {
        return true;
    }
    match text.strip_prefix('~') {
        Some(ident) => {
            !ident.is_empty() && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Split one line into tokens. `:` and `>>` are always tokens of their own.
fn tokenize(chars: &[char], line_offset: usize, line: u32) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;

    let make = |from: usize, to: usize| Token {
        text: chars[from..to].iter().collect(),
        span: Span {
            start: line_offset + from,
            end: line_offset + to,
            line,
            column: from as u32 + 1,
        },
    };

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == ':' {
            tokens.push(make(i, i + 1));
            i += 1;
        } else if c == '>' && chars.get(i + 1) == Some(&'>') {
            tokens.push(make(i, i + 2));
            i += 2;
        } else {
            let from = i;
            while i < chars.len() {
                let c = chars[i];
                if c.is_whitespace() || c == ':' || (c == '>' && chars.get(i + 1) == Some(&'>')) {
                    break;
                }
                i += 1;
            }
            tokens.push(make(from, i));
        }
    }
    tokens
}

/// Group the tokens after a `:` (or a leading `>>`) into nodes.
fn split_nodes(tokens: &[Token], anchor: Span) -> Result<Vec<NodeDef>, ParseError> {
    let mut nodes = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut last_separator = anchor;

    let mut flush = |current: &mut Vec<Token>, at: Span| -> Result<(), ParseError> {
        if current.is_empty() {
            return Err(ParseError::at(at, "expected a node"));
        }
        let mut parts = current.drain(..);
        if let Some(name) = parts.next() {
            nodes.push(NodeDef {
                name,
                args: parts.collect(),
            });
        }
        Ok(())
    };

    for token in tokens {
        match token.text.as_str() {
            ">>" => {
                flush(&mut current, last_separator)?;
                last_separator = token.span;
            }
            ":" => return Err(ParseError::at(token.span, "unexpected `:`")),
            _ => current.push(token.clone()),
        }
    }
    flush(&mut current, last_separator)?;
    Ok(nodes)
}

pub fn parse(code: &str) -> Result<Program, ParseError> {
    let mut program = Program::default();
    let mut line_offset = 0;

    for (index, raw) in code.split('\n').enumerate() {
        let line = index as u32 + 1;
        let chars: Vec<char> = raw.chars().collect();
        let content_end = chars
            .windows(2)
            .position(|w| w == ['/', '/'])
            .unwrap_or(chars.len());
        let tokens = tokenize(&chars[..content_end], line_offset, line);
        line_offset += chars.len() + 1;

        let Some(first) = tokens.first() else {
            continue;
        };

        if first.text == ">>" {
            let Some(chain) = program.chains.last_mut() else {
                return Err(ParseError::at(first.span, "`>>` with no chain to continue"));
            };
            let more = split_nodes(&tokens[1..], first.span)?;
            chain.nodes.extend(more);
            continue;
        }

        match tokens.get(1) {
            Some(colon) if colon.text == ":" => {}
            _ => {
                return Err(ParseError::at(
                    first.span,
                    format!("expected `name:` to start a chain, found `{}`", first.text),
                ))
            }
        }
        if !is_chain_name(&first.text) {
            return Err(ParseError::at(
                first.span,
                format!("invalid chain name `{}`; use `out` or `~name`", first.text),
            ));
        }
        let nodes = split_nodes(&tokens[2..], tokens[1].span)?;
        program.chains.push(ChainDef {
            name: first.clone(),
            nodes,
        });
    }

    Ok(program)
}
