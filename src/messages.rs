//! Host <-> sandbox message protocol
//!
//! Every message crossing the isolation boundary is JSON text tagged by `type`.
//! Only strings, numbers and numeric arrays travel, so nothing executable can
//! leak across. Inbound payloads are checked with [`is_inbound_message`] before
//! any field is trusted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::AudioFrame;
use crate::error::{ProtocolError, RuntimeFault};

/// Identity of one isolated context. Used to reject messages from contexts
/// the receiver does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// One payload plus the context it came from, as delivered to the host inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: ContextId,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToSandbox,
    SandboxToHost,
}

/// Every message exchanged between the host and an isolated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Context finished booting and accepts code
    Ready,
    /// Evaluate code
    RunCode { code: String },
    /// Clear accumulated runtime counters, then evaluate code
    SoftReset { code: String },
    /// Evaluation succeeded
    RunOk { timestamp: f64 },
    /// Evaluation failed; the run is over
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },
    /// A dynamic parameter failed while already running
    SynthError {
        message: String,
        #[serde(
            default,
            rename = "uniformName",
            alias = "paramName",
            skip_serializing_if = "Option::is_none"
        )]
        param_name: Option<String>,
    },
    /// Analyser snapshot
    AudioData {
        fft: Vec<u8>,
        waveform: Vec<u8>,
        timestamp: f64,
    },
    /// User asked the host to show/hide its chrome
    ToggleUi,
}

/// (tag, direction) for every variant. `AUDIO_DATA` travels both ways.
const TAGS: &[(&str, Direction)] = &[
    ("READY", Direction::SandboxToHost),
    ("RUN_CODE", Direction::HostToSandbox),
    ("SOFT_RESET", Direction::HostToSandbox),
    ("RUN_OK", Direction::SandboxToHost),
    ("RUN_ERROR", Direction::SandboxToHost),
    ("SYNTH_ERROR", Direction::SandboxToHost),
    ("AUDIO_DATA", Direction::HostToSandbox),
    ("TOGGLE_UI", Direction::SandboxToHost),
];

fn tag_of(value: &Value) -> Result<&str, ProtocolError> {
    value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTag)
}

fn known_tag(tag: &str) -> Result<(&'static str, Direction), ProtocolError> {
    TAGS.iter()
        .find(|(known, _)| *known == tag)
        .copied()
        .ok_or_else(|| ProtocolError::UnknownTag(tag.to_string()))
}

/// True if `value` is a well-formed message a host may receive from a sandbox.
///
/// The tag is checked first; fields are only looked at once the tag is known.
pub fn is_inbound_message(value: &Value) -> bool {
    accepts(value, Direction::SandboxToHost)
}

/// True if `value` is a well-formed message a sandbox may receive from its host.
pub fn is_outbound_message(value: &Value) -> bool {
    accepts(value, Direction::HostToSandbox)
}

fn accepts(value: &Value, direction: Direction) -> bool {
    let Ok(tag) = tag_of(value) else {
        return false;
    };
    let Ok((tag, tag_direction)) = known_tag(tag) else {
        return false;
    };
    if tag_direction != direction && tag != "AUDIO_DATA" {
        return false;
    }
    Message::deserialize(value).is_ok()
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Ready => "READY",
            Message::RunCode { .. } => "RUN_CODE",
            Message::SoftReset { .. } => "SOFT_RESET",
            Message::RunOk { .. } => "RUN_OK",
            Message::RunError { .. } => "RUN_ERROR",
            Message::SynthError { .. } => "SYNTH_ERROR",
            Message::AudioData { .. } => "AUDIO_DATA",
            Message::ToggleUi => "TOGGLE_UI",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Message::RunCode { .. } | Message::SoftReset { .. } | Message::AudioData { .. } => {
                Direction::HostToSandbox
            }
            _ => Direction::SandboxToHost,
        }
    }

    /// Parse and validate a payload. Nothing is partially applied: either the
    /// whole message is well-formed or an error comes back.
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(payload)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        known_tag(tag_of(&value)?)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Decode a payload and require it to travel in `direction`.
    pub fn decode_from(payload: &str, direction: Direction) -> Result<Self, ProtocolError> {
        let message = Self::decode(payload)?;
        let allowed = message.direction() == direction || matches!(message, Message::AudioData { .. });
        if allowed {
            Ok(message)
        } else {
            Err(ProtocolError::WrongDirection { tag: message.tag() })
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn run_error(fault: RuntimeFault) -> Self {
        Message::RunError {
            message: fault.message,
            stack: fault.stack,
            line: fault.line,
            column: fault.column,
        }
    }

    pub fn audio_data(frame: &AudioFrame) -> Self {
        Message::AudioData {
            fft: frame.fft.clone(),
            waveform: frame.waveform.clone(),
            timestamp: frame.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_tags_match_protocol() {
        let encoded = Message::RunCode {
            code: "out: sin 440".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(encoded, r#"{"type":"RUN_CODE","code":"out: sin 440"}"#);

        let encoded = Message::ToggleUi.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"TOGGLE_UI"}"#);
    }

    #[test]
    fn test_run_error_optional_fields() {
        let msg = Message::decode(r#"{"type":"RUN_ERROR","message":"boom","line":3}"#).unwrap();
        assert_eq!(
            msg,
            Message::RunError {
                message: "boom".into(),
                stack: None,
                line: Some(3),
                column: None,
            }
        );
    }

    #[test]
    fn test_synth_error_uniform_name() {
        let msg =
            Message::decode(r#"{"type":"SYNTH_ERROR","message":"nan","uniformName":"level"}"#)
                .unwrap();
        assert_eq!(
            msg,
            Message::SynthError {
                message: "nan".into(),
                param_name: Some("level".into()),
            }
        );

        let alias =
            Message::decode(r#"{"type":"SYNTH_ERROR","message":"nan","paramName":"level"}"#)
                .unwrap();
        assert_eq!(alias, msg);
    }

    #[test]
    fn test_inbound_rejects_missing_or_unknown_tag() {
        assert!(!is_inbound_message(&json!({"code": "x"})));
        assert!(!is_inbound_message(&json!({"type": 7})));
        assert!(!is_inbound_message(&json!({"type": "EVAL"})));
        assert!(!is_inbound_message(&json!("READY")));
        assert!(is_inbound_message(&json!({"type": "READY"})));
    }

    #[test]
    fn test_inbound_rejects_wrong_field_types() {
        assert!(!is_inbound_message(&json!({"type": "RUN_OK", "timestamp": "now"})));
        assert!(!is_inbound_message(&json!({"type": "RUN_ERROR"})));
        assert!(!is_inbound_message(&json!({"type": "RUN_ERROR", "message": "x", "line": "3"})));
        assert!(!is_inbound_message(
            &json!({"type": "AUDIO_DATA", "fft": [1, 300], "waveform": [], "timestamp": 0})
        ));
        assert!(is_inbound_message(&json!({"type": "RUN_OK", "timestamp": 12})));
    }

    #[test]
    fn test_inbound_rejects_host_only_messages() {
        assert!(!is_inbound_message(&json!({"type": "RUN_CODE", "code": "x"})));
        assert!(is_outbound_message(&json!({"type": "RUN_CODE", "code": "x"})));
        assert!(!is_outbound_message(&json!({"type": "READY"})));
    }

    #[test]
    fn test_decode_from_enforces_direction() {
        let err = Message::decode_from(r#"{"type":"READY"}"#, Direction::HostToSandbox);
        assert!(matches!(err, Err(ProtocolError::WrongDirection { tag: "READY" })));

        let ok = Message::decode_from(
            r#"{"type":"AUDIO_DATA","fft":[1],"waveform":[128,128],"timestamp":1.5}"#,
            Direction::HostToSandbox,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"NOPE"}"#),
            Err(ProtocolError::UnknownTag(tag)) if tag == "NOPE"
        ));
    }
}
