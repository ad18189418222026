//! Audio-reactive parameter injection
//!
//! Appends `~name: param name` definitions for audio-reactive parameters the
//! user code references but does not define itself. This lets code such as
//! `out: saw 110 >> lpf ~bass 2 >> mul ~level` follow the analysed output.
//! Definitions go after the user's lines so reported line numbers still
//! match the editor.

use super::graph::ParamSource;
use crate::analysis::AudioFrame;

/// All injectable parameter names
pub const PARAM_NAMES: &[&str] = &["level", "bass", "mid", "treble"];

/// Spectrum split points as fractions of the analysed bins
const BASS_END: f32 = 0.1;
const MID_END: f32 = 0.4;

/// Latest parameter values, refreshed from each audio frame
#[derive(Debug, Clone, Default)]
pub struct ParamInjector {
    pub level: f32,
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `~name` appears as a whole word somewhere in `code`
fn references(code: &str, name: &str) -> bool {
    let reference = format!("~{name}");
    code.match_indices(&reference).any(|(at, _)| {
        !code[at + reference.len()..]
            .chars()
            .next()
            .is_some_and(is_ident_char)
    })
}

/// Some line starts a chain named `~name`
fn defines(code: &str, name: &str) -> bool {
    let reference = format!("~{name}");
    code.lines().any(|line| {
        line.trim_start()
            .strip_prefix(&reference)
            .is_some_and(|rest| rest.trim_start().starts_with(':'))
    })
}

impl ParamInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_from_frame(&mut self, frame: &AudioFrame) {
        self.level = frame.level();
        self.bass = frame.band(0.0, BASS_END);
        self.mid = frame.band(BASS_END, MID_END);
        self.treble = frame.band(MID_END, 1.0);
    }

    /// Inject parameter definitions into user code
    ///
    /// Example:
    /// - User writes: `out: sin 220 >> mul ~level`
    /// - Becomes:
    ///   ```text
    ///   out: sin 220 >> mul ~level
    ///   ~level: param level
    ///   ```
    pub fn inject(&self, user_code: &str) -> String {
        let injected_lines: Vec<String> = PARAM_NAMES
            .iter()
            .filter(|name| references(user_code, name) && !defines(user_code, name))
            .map(|name| format!("~{name}: param {name}"))
            .collect();

        if injected_lines.is_empty() {
            user_code.to_string()
        } else {
            format!("{}\n{}", user_code, injected_lines.join("\n"))
        }
    }

    /// Get the value of a parameter by name
    pub fn get_value(&self, name: &str) -> Option<f32> {
        match name {
            "level" => Some(self.level),
            "bass" => Some(self.bass),
            "mid" => Some(self.mid),
            "treble" => Some(self.treble),
            _ => None,
        }
    }
}

impl ParamSource for ParamInjector {
    fn param(&self, name: &str) -> Option<f32> {
        self.get_value(name)
    }
}
