//! Execution channel
//!
//! Owns one isolated context at a time and mediates code delivery to it.
//! While the context has not yet signalled `READY`, at most one code payload
//! is held back (last write wins) and sent exactly once on readiness.
//! Everything arriving from the context is validated and turned into
//! [`ChannelEvent`]s for the owner; envelopes from any other context are
//! ignored.

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::analysis::AudioFrame;
use crate::controller::Executor;
use crate::error::{ChannelError, RuntimeFault};
use crate::messages::{ContextId, Direction, Envelope, Message};

/// What an isolated context is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scripts: bool,
    pub network: bool,
    pub storage: bool,
}

impl Capabilities {
    pub const SCRIPTS_ONLY: Capabilities = Capabilities {
        scripts: true,
        network: false,
        storage: false,
    };
}

/// The fixed resource a fresh context boots from, plus its grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub resource: String,
    pub capabilities: Capabilities,
}

impl Bootstrap {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            capabilities: Capabilities::SCRIPTS_ONLY,
        }
    }
}

/// Host-side handle to one isolated context.
pub trait ContextHandle: Send {
    fn id(&self) -> ContextId;

    /// Deliver a JSON payload. Fire-and-forget.
    fn post(&self, payload: String) -> Result<(), ChannelError>;

    /// Tear the context down. Nothing it sent afterwards is meaningful.
    fn destroy(self: Box<Self>);
}

pub trait ContextFactory {
    fn create(&mut self, bootstrap: &Bootstrap) -> Result<Box<dyn ContextHandle>, ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotReady,
    Ready,
}

/// Validated message from the owned context.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Ready,
    RunOk { timestamp: f64 },
    RunError(RuntimeFault),
    SynthError {
        message: String,
        param_name: Option<String>,
    },
    AudioData(AudioFrame),
    ToggleUi,
}

pub struct ExecutionChannel<F: ContextFactory> {
    factory: F,
    bootstrap: Bootstrap,
    context: Option<Box<dyn ContextHandle>>,
    state: ChannelState,
    pending_code: Option<String>,
}

impl<F: ContextFactory> ExecutionChannel<F> {
    /// No context exists until [`initialize`](Self::initialize) is called.
    pub fn new(factory: F, bootstrap: Bootstrap) -> Self {
        Self {
            factory,
            bootstrap,
            context: None,
            state: ChannelState::NotReady,
            pending_code: None,
        }
    }

    /// Destroy any previous context and boot a fresh one. A payload queued
    /// before this call is still delivered once the new context is ready.
    pub fn initialize(&mut self) -> Result<ContextId, ChannelError> {
        if let Some(old) = self.context.take() {
            debug!(context = %old.id(), "destroying isolated context");
            old.destroy();
        }
        self.state = ChannelState::NotReady;

        let context = self.factory.create(&self.bootstrap)?;
        let id = context.id();
        debug!(context = %id, resource = %self.bootstrap.resource, "created isolated context");
        self.context = Some(context);
        Ok(id)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn pending_code(&self) -> Option<&str> {
        self.pending_code.as_deref()
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(|c| c.id())
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn post(&self, message: &Message) -> Result<(), ChannelError> {
        let context = self.context.as_ref().ok_or(ChannelError::NoContext)?;
        match message.encode() {
            Ok(payload) => context.post(payload),
            Err(err) => {
                warn!(%err, tag = message.tag(), "could not encode message");
                Ok(())
            }
        }
    }

    fn send_when_ready(&mut self, message: Message, code: &str) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::NotReady => {
                self.pending_code = Some(code.to_string());
                Ok(())
            }
            ChannelState::Ready => self.post(&message),
        }
    }

    /// Run `code` now, or once the context is ready.
    pub fn force_run(&mut self, code: &str) -> Result<(), ChannelError> {
        let message = Message::RunCode {
            code: code.to_string(),
        };
        self.send_when_ready(message, code)
    }

    /// Reset runtime counters and run `code`, gated like `force_run`.
    pub fn soft_reset(&mut self, code: &str) -> Result<(), ChannelError> {
        let message = Message::SoftReset {
            code: code.to_string(),
        };
        self.send_when_ready(message, code)
    }

    /// Forward an analyser snapshot. Dropped while the context is not ready.
    pub fn send_audio(&self, frame: &AudioFrame) -> Result<(), ChannelError> {
        if self.state == ChannelState::NotReady {
            return Ok(());
        }
        self.post(&Message::audio_data(frame))
    }

    /// Validate one envelope from the inbox.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> Option<ChannelEvent> {
        if self.context_id() != Some(envelope.origin) {
            debug!(origin = %envelope.origin, "ignoring message from foreign context");
            return None;
        }
        let message = match Message::decode_from(&envelope.payload, Direction::SandboxToHost) {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, origin = %envelope.origin, "dropping malformed message");
                return None;
            }
        };

        let event = match message {
            Message::Ready => {
                self.state = ChannelState::Ready;
                debug!(context = %envelope.origin, "isolated context ready");
                if let Some(code) = self.pending_code.take() {
                    if let Err(err) = self.post(&Message::RunCode { code }) {
                        warn!(%err, "failed to deliver queued code");
                    }
                }
                ChannelEvent::Ready
            }
            Message::RunOk { timestamp } => ChannelEvent::RunOk { timestamp },
            Message::RunError {
                message,
                stack,
                line,
                column,
            } => ChannelEvent::RunError(RuntimeFault {
                message,
                stack,
                line,
                column,
            }),
            Message::SynthError {
                message,
                param_name,
            } => ChannelEvent::SynthError {
                message,
                param_name,
            },
            Message::AudioData {
                fft,
                waveform,
                timestamp,
            } => ChannelEvent::AudioData(AudioFrame {
                fft,
                waveform,
                timestamp,
            }),
            Message::ToggleUi => ChannelEvent::ToggleUi,
            Message::RunCode { .. } | Message::SoftReset { .. } => return None,
        };
        Some(event)
    }

    /// Handle everything currently waiting in `inbox`.
    pub fn drain(&mut self, inbox: &Receiver<Envelope>) -> Vec<ChannelEvent> {
        inbox
            .try_iter()
            .filter_map(|envelope| self.handle_envelope(&envelope))
            .collect()
    }
}

impl<F: ContextFactory> Executor for ExecutionChannel<F> {
    fn execute(&mut self, code: &str) {
        if let Err(err) = self.force_run(code) {
            warn!(%err, "failed to send code");
        }
    }

    fn soft_reset(&mut self, code: &str) {
        if let Err(err) = ExecutionChannel::soft_reset(self, code) {
            warn!(%err, "failed to send soft reset");
        }
    }
}

impl<F: ContextFactory> Drop for ExecutionChannel<F> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            context.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        posts: Vec<(ContextId, Value)>,
        destroyed: Vec<ContextId>,
    }

    struct FakeHandle {
        id: ContextId,
        log: Arc<Mutex<Log>>,
    }

    impl ContextHandle for FakeHandle {
        fn id(&self) -> ContextId {
            self.id
        }

        fn post(&self, payload: String) -> Result<(), ChannelError> {
            let value = serde_json::from_str(&payload).unwrap();
            self.log.lock().posts.push((self.id, value));
            Ok(())
        }

        fn destroy(self: Box<Self>) {
            self.log.lock().destroyed.push(self.id);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        next: u64,
        log: Arc<Mutex<Log>>,
        bootstraps: Vec<Bootstrap>,
    }

    impl ContextFactory for FakeFactory {
        fn create(&mut self, bootstrap: &Bootstrap) -> Result<Box<dyn ContextHandle>, ChannelError> {
            self.next += 1;
            self.bootstraps.push(bootstrap.clone());
            Ok(Box::new(FakeHandle {
                id: ContextId(self.next),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn channel() -> (ExecutionChannel<FakeFactory>, Arc<Mutex<Log>>) {
        let factory = FakeFactory::default();
        let log = Arc::clone(&factory.log);
        let mut channel = ExecutionChannel::new(factory, Bootstrap::new("glicol"));
        channel.initialize().unwrap();
        (channel, log)
    }

    fn from(origin: u64, value: Value) -> Envelope {
        Envelope {
            origin: ContextId(origin),
            payload: value.to_string(),
        }
    }

    fn ready(origin: u64) -> Envelope {
        from(origin, json!({"type": "READY"}))
    }

    #[test]
    fn test_bootstrap_grants_scripts_only() {
        let (channel, _) = channel();
        let bootstrap = &channel.factory().bootstraps[0];
        assert_eq!(bootstrap.resource, "glicol");
        assert_eq!(bootstrap.capabilities, Capabilities::SCRIPTS_ONLY);
    }

    #[test]
    fn test_queued_code_sent_once_on_ready() {
        let (mut channel, log) = channel();
        channel.force_run("first").unwrap();
        channel.force_run("second").unwrap();
        assert_eq!(channel.pending_code(), Some("second"));
        assert!(log.lock().posts.is_empty());

        assert_eq!(channel.handle_envelope(&ready(1)), Some(ChannelEvent::Ready));
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(channel.pending_code(), None);

        channel.handle_envelope(&ready(1));
        let log = log.lock();
        let posts = &log.posts;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1, json!({"type": "RUN_CODE", "code": "second"}));
    }

    #[test]
    fn test_ready_channel_sends_immediately() {
        let (mut channel, log) = channel();
        channel.handle_envelope(&ready(1));
        channel.force_run("a").unwrap();
        channel.soft_reset("b").unwrap();

        let log = log.lock();
        let posts = &log.posts;
        assert_eq!(posts[0].1["type"], "RUN_CODE");
        assert_eq!(posts[1].1, json!({"type": "SOFT_RESET", "code": "b"}));
    }

    #[test]
    fn test_soft_reset_before_ready_is_queued() {
        let (mut channel, log) = channel();
        channel.soft_reset("code").unwrap();
        channel.handle_envelope(&ready(1));
        assert_eq!(log.lock().posts[0].1["type"], "RUN_CODE");
    }

    #[test]
    fn test_malformed_messages_change_nothing() {
        let (mut channel, log) = channel();
        channel.force_run("queued").unwrap();

        let bad = [
            Envelope {
                origin: ContextId(1),
                payload: "not json".into(),
            },
            from(1, json!({})),
            from(1, json!({"type": "BOGUS"})),
            from(1, json!({"type": "RUN_OK", "timestamp": "soon"})),
            from(1, json!({"type": "RUN_ERROR"})),
            from(1, json!({"type": "RUN_CODE", "code": "x"})),
            from(1, json!(["READY"])),
        ];
        for envelope in &bad {
            assert_eq!(channel.handle_envelope(envelope), None);
        }
        assert_eq!(channel.state(), ChannelState::NotReady);
        assert_eq!(channel.pending_code(), Some("queued"));
        assert!(log.lock().posts.is_empty());
    }

    #[test]
    fn test_foreign_context_ignored() {
        let (mut channel, log) = channel();
        channel.force_run("code").unwrap();
        assert_eq!(channel.handle_envelope(&ready(99)), None);
        assert_eq!(channel.state(), ChannelState::NotReady);
        assert!(log.lock().posts.is_empty());
    }

    #[test]
    fn test_reinitialize_replaces_context() {
        let (mut channel, log) = channel();
        channel.handle_envelope(&ready(1));
        channel.force_run("pending").unwrap();

        let id = channel.initialize().unwrap();
        assert_eq!(id, ContextId(2));
        assert_eq!(channel.state(), ChannelState::NotReady);
        assert_eq!(log.lock().destroyed, vec![ContextId(1)]);

        // the old context's late messages no longer count
        assert_eq!(
            channel.handle_envelope(&from(1, json!({"type": "RUN_OK", "timestamp": 1.0}))),
            None
        );
        assert_eq!(channel.handle_envelope(&ready(2)), Some(ChannelEvent::Ready));
    }

    #[test]
    fn test_events_are_forwarded() {
        let (mut channel, _) = channel();
        let (tx, rx) = crossbeam_channel::unbounded();
        for value in [
            json!({"type": "READY"}),
            json!({"type": "RUN_OK", "timestamp": 12.5}),
            json!({"type": "RUN_ERROR", "message": "bad", "line": 2, "column": 4}),
            json!({"type": "SYNTH_ERROR", "message": "nan", "uniformName": "level"}),
            json!({"type": "AUDIO_DATA", "fft": [1, 2], "waveform": [3, 4, 5, 6], "timestamp": 3.0}),
            json!({"type": "TOGGLE_UI"}),
        ] {
            tx.send(from(1, value)).unwrap();
        }

        let events = channel.drain(&rx);
        assert_eq!(events.len(), 6);
        assert_eq!(events[1], ChannelEvent::RunOk { timestamp: 12.5 });
        assert_eq!(
            events[2],
            ChannelEvent::RunError(RuntimeFault::new("bad").at(2, 4))
        );
        assert_eq!(
            events[3],
            ChannelEvent::SynthError {
                message: "nan".into(),
                param_name: Some("level".into())
            }
        );
        assert!(matches!(&events[4], ChannelEvent::AudioData(frame) if frame.waveform.len() == 4));
        assert_eq!(events[5], ChannelEvent::ToggleUi);
    }

    #[test]
    fn test_audio_dropped_until_ready() {
        let (mut channel, log) = channel();
        let frame = AudioFrame {
            fft: vec![0; 2],
            waveform: vec![128; 4],
            timestamp: 1.0,
        };
        channel.send_audio(&frame).unwrap();
        assert!(log.lock().posts.is_empty());

        channel.handle_envelope(&ready(1));
        channel.send_audio(&frame).unwrap();
        assert_eq!(log.lock().posts[0].1["type"], "AUDIO_DATA");
    }

    #[test]
    fn test_uninitialized_channel_queues() {
        let mut channel = ExecutionChannel::new(FakeFactory::default(), Bootstrap::new("glicol"));
        channel.force_run("early").unwrap();
        assert_eq!(channel.pending_code(), Some("early"));
        assert_eq!(channel.context_id(), None);
    }

    #[test]
    fn test_drop_destroys_context() {
        let (channel, log) = channel();
        drop(channel);
        assert_eq!(log.lock().destroyed, vec![ContextId(1)]);
    }
}
