//! A live-coding session: one visual and one audio runtime side by side.
//!
//! The visual runtime runs in an isolated context behind an
//! [`ExecutionChannel`]; the audio runtime renders in-process and drives the
//! pattern highlighter and the analysis bridge. [`LiveSession::frame`] is the
//! per-animation-frame entry point that moves every signal along.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, warn};

use crate::analysis::AudioBridge;
use crate::channel::{Bootstrap, ChannelEvent, ExecutionChannel};
use crate::config::{SettingsSource, SharedSettings};
use crate::controller::{ExecutionController, InteractionKind, RuntimeId};
use crate::editor::Editor;
use crate::engine::{LocalExecutor, RunSignal};
use crate::error::{ChannelError, CodeError};
use crate::highlight::PatternHighlighter;
use crate::messages::Envelope;
use crate::pattern::SeqPattern;
use crate::sandbox::{RuntimeRegistry, ThreadSandbox};
use crate::store::CodeStore;
use crate::timer::Millis;

/// Bootstrap resource of the visual context
pub const VISUAL_RESOURCE: &str = "glicol";

pub type VisualController = ExecutionController<ExecutionChannel<ThreadSandbox>>;
pub type AudioController = ExecutionController<LocalExecutor>;

pub struct LiveSession<VE: Editor, AE: Editor> {
    settings: SharedSettings,
    visual: VisualController,
    audio: AudioController,
    inbox: Receiver<Envelope>,
    visual_editor: VE,
    audio_editor: AE,
    highlighter: PatternHighlighter,
    bridge: AudioBridge,
    ui_visible: bool,
}

impl<VE: Editor, AE: Editor> LiveSession<VE, AE> {
    pub fn new(
        settings: SharedSettings,
        store: Arc<dyn CodeStore>,
        visual_editor: VE,
        audio_editor: AE,
    ) -> Result<Self, ChannelError> {
        let registry = RuntimeRegistry::with_defaults(&settings.snapshot());
        Self::with_sandbox(
            settings,
            store,
            registry,
            Bootstrap::new(VISUAL_RESOURCE),
            visual_editor,
            audio_editor,
        )
    }

    /// Session whose visual context boots `bootstrap` from `registry`.
    pub fn with_sandbox(
        settings: SharedSettings,
        store: Arc<dyn CodeStore>,
        registry: RuntimeRegistry,
        bootstrap: Bootstrap,
        mut visual_editor: VE,
        mut audio_editor: AE,
    ) -> Result<Self, ChannelError> {
        let snapshot = settings.snapshot();
        let source: Arc<dyn SettingsSource> = Arc::new(settings.clone());

        let (outbox, inbox) = unbounded();
        let mut channel = ExecutionChannel::new(ThreadSandbox::new(outbox, registry), bootstrap);
        channel.initialize()?;
        let visual = ExecutionController::new(
            RuntimeId::VISUAL,
            channel,
            Arc::clone(&source),
            Arc::clone(&store),
        );

        let (executor, tap) = LocalExecutor::from_settings(&snapshot);
        let audio = ExecutionController::new(RuntimeId::AUDIO, executor, source, store);

        if let Some(code) = visual.saved_code() {
            visual_editor.set_value(&code);
        }
        if let Some(code) = audio.saved_code() {
            audio_editor.set_value(&code);
        }

        let mut bridge = AudioBridge::new();
        bridge.set_source(Box::new(tap));
        bridge.start();
        let mut highlighter = PatternHighlighter::new(snapshot.lookahead_cycles);
        highlighter.start();

        Ok(Self {
            settings,
            visual,
            audio,
            inbox,
            visual_editor,
            audio_editor,
            highlighter,
            bridge,
            ui_visible: true,
        })
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn visual(&self) -> &VisualController {
        &self.visual
    }

    pub fn audio(&self) -> &AudioController {
        &self.audio
    }

    pub fn visual_editor(&self) -> &VE {
        &self.visual_editor
    }

    pub fn visual_editor_mut(&mut self) -> &mut VE {
        &mut self.visual_editor
    }

    pub fn audio_editor(&self) -> &AE {
        &self.audio_editor
    }

    pub fn audio_editor_mut(&mut self) -> &mut AE {
        &mut self.audio_editor
    }

    pub fn highlighter(&self) -> &PatternHighlighter {
        &self.highlighter
    }

    /// For audio-reactive consumers that want their own frame subscription
    pub fn bridge_mut(&mut self) -> &mut AudioBridge {
        &mut self.bridge
    }

    pub fn ui_visible(&self) -> bool {
        self.ui_visible
    }

    /// The visual editor's text changed.
    pub fn visual_edited(&mut self, now: Millis) {
        let code = self.visual_editor.value();
        self.visual.handle_code_change(now, &code);
    }

    /// The audio editor's text changed.
    pub fn audio_edited(&mut self, now: Millis) {
        let code = self.audio_editor.value();
        self.audio.handle_code_change(now, &code);
    }

    pub fn force_run_visual(&mut self) {
        self.visual.handle_force_run(&mut self.visual_editor);
    }

    pub fn force_run_audio(&mut self) {
        self.audio.handle_force_run(&mut self.audio_editor);
    }

    pub fn soft_reset_visual(&mut self) {
        self.visual.handle_soft_reset(&mut self.visual_editor);
    }

    pub fn soft_reset_audio(&mut self) {
        self.audio.handle_soft_reset(&mut self.audio_editor);
    }

    pub fn revert_visual(&mut self) -> bool {
        self.visual
            .handle_revert_to_last_working(&mut self.visual_editor)
    }

    pub fn revert_audio(&mut self) -> bool {
        self.audio
            .handle_revert_to_last_working(&mut self.audio_editor)
    }

    pub fn dismiss_errors(&mut self) {
        self.visual.dismiss_error(&mut self.visual_editor);
        self.audio.dismiss_error(&mut self.audio_editor);
    }

    /// A user gesture; the first one unlocks audio.
    pub fn interaction(&mut self, kind: InteractionKind) -> bool {
        self.audio.handle_interaction(kind)
    }

    /// Replace the visual context and re-run the editor's code in it.
    pub fn reload(&mut self) -> Result<(), ChannelError> {
        self.visual.executor_mut().initialize()?;
        self.visual.handle_force_run(&mut self.visual_editor);
        Ok(())
    }

    fn handle_channel_event(&mut self, now: Millis, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready => {}
            ChannelEvent::RunOk { .. } => self.visual.on_run_ok(now, &mut self.visual_editor),
            ChannelEvent::RunError(fault) => self.visual.on_error(
                CodeError::execution(RuntimeId::VISUAL, fault),
                &mut self.visual_editor,
            ),
            ChannelEvent::SynthError {
                message,
                param_name,
            } => self.visual.on_error(
                CodeError::parameter(RuntimeId::VISUAL, message, param_name),
                &mut self.visual_editor,
            ),
            ChannelEvent::AudioData(_) => {
                debug!("ignoring audio data sent to the host");
            }
            ChannelEvent::ToggleUi => self.ui_visible = !self.ui_visible,
        }
    }

    fn handle_run_signal(&mut self, now: Millis, signal: RunSignal) {
        match signal {
            RunSignal::Ok { code, .. } => {
                self.install_pattern(&code);
                self.audio.on_run_ok_for(now, code, &mut self.audio_editor);
            }
            RunSignal::Error(fault) => self.audio.on_error(
                CodeError::execution(RuntimeId::AUDIO, fault),
                &mut self.audio_editor,
            ),
            RunSignal::Param(fault) => self.audio.on_error(
                CodeError::parameter(RuntimeId::AUDIO, fault.message, fault.param_name),
                &mut self.audio_editor,
            ),
        }
    }

    /// Point the highlighter at the `seq` steps of `code`, which just started
    /// playing. Later requests may already be queued behind it.
    fn install_pattern(&mut self, code: &str) {
        match SeqPattern::from_code(code) {
            Ok(pattern) => {
                let clock = self.audio.executor().transport();
                self.highlighter
                    .set_pattern(&mut self.audio_editor, Box::new(pattern), Box::new(clock));
                self.highlighter.set_source(code);
            }
            Err(err) => debug!(%err, "no pattern for running code"),
        }
    }

    /// One animation frame at host time `now`.
    pub fn frame(&mut self, now: Millis) {
        let events = self.visual.executor_mut().drain(&self.inbox);
        for event in events {
            self.handle_channel_event(now, event);
        }

        self.audio.executor_mut().render_until(now);
        let signals = self.audio.executor_mut().drain_signals();
        for signal in signals {
            self.handle_run_signal(now, signal);
        }

        self.visual.poll(now);
        self.audio.poll(now);

        self.highlighter.frame(&mut self.audio_editor);

        if let Some(snapshot) = self.bridge.frame(now) {
            if let Err(err) = self.visual.executor().send_audio(&snapshot) {
                warn!(%err, "failed to forward audio data");
            }
        }
    }

    /// Stop the highlighter and the bridge. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.highlighter.stop(&mut self.audio_editor);
        self.bridge.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::editor::TextModel;
    use crate::error::RuntimeFault;
    use crate::runtime::{ParamFault, Runtime};
    use crate::store::MemoryStore;
    use std::thread;
    use std::time::Duration;

    type Session = LiveSession<TextModel, TextModel>;

    fn session() -> Session {
        LiveSession::new(
            SharedSettings::default(),
            Arc::new(MemoryStore::new()),
            TextModel::new(""),
            TextModel::new(""),
        )
        .unwrap()
    }

    /// Run frames 16ms apart until `done` holds, giving the sandbox thread
    /// real time to answer.
    fn run_until(session: &mut Session, start: Millis, done: impl Fn(&Session) -> bool) -> Millis {
        let mut now = start;
        for _ in 0..1000 {
            session.frame(now);
            if done(session) {
                return now;
            }
            now += 16;
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_visual_round_trip_confirms_code() {
        let mut session = session();
        session.visual_editor_mut().set_value("out: sig 0");
        session.force_run_visual();

        run_until(&mut session, 0, |s| {
            s.visual().state().last_working_code() == Some("out: sig 0")
        });
        assert!(session.visual().error().is_none());
    }

    #[test]
    fn test_visual_error_sets_marker() {
        let mut session = session();
        session.visual_editor_mut().set_value("out: sig 0\n~a: nope");
        session.force_run_visual();

        run_until(&mut session, 0, |s| s.visual().error().is_some());
        let marker = &session.visual_editor().markers()[0];
        assert_eq!(marker.position.line, 2);
        assert_eq!(marker.message, "unknown node `nope`");
    }

    #[test]
    fn test_debounced_visual_edits() {
        let mut session = session();
        session.visual_editor_mut().set_value("out: sig 1");
        session.visual_edited(0);
        session.visual_editor_mut().set_value("out: sig 2");
        session.visual_edited(100);

        let confirmed_at = run_until(&mut session, 100, |s| {
            s.visual().state().last_working_code().is_some()
        });
        assert_eq!(
            session.visual().state().last_working_code(),
            Some("out: sig 2")
        );
        assert!(confirmed_at >= 600);
    }

    #[test]
    fn test_audio_pattern_highlights_playing_step() {
        let mut session = session();
        assert!(session.interaction(InteractionKind::Click));
        session
            .audio_editor_mut()
            .set_value("out: seq 60 _ 67 >> saw >> mul 0.2");
        session.force_run_audio();

        session.frame(0);
        assert!(session.highlighter().has_pattern());
        session.frame(200);
        assert_eq!(session.audio_editor().decorated_text(), vec!["60".to_string()]);
        session.frame(1000);
        assert!(session.audio_editor().decorated_text().is_empty());
        session.frame(1500);
        assert_eq!(session.audio_editor().decorated_text(), vec!["67".to_string()]);

        session.frame(1500 + crate::config::CONFIRMATION_DELAY_MS);
        assert!(session.audio().state().last_working_code().is_some());
    }

    #[test]
    fn test_audio_error_marks_editor_and_keeps_playing() {
        let mut session = session();
        session.interaction(InteractionKind::KeyDown);
        session.audio_editor_mut().set_value("out: sig 0.1");
        session.force_run_audio();
        session.frame(0);
        session.frame(200);

        session.audio_editor_mut().set_value("out: sig 0.1 >> bogus 2");
        session.force_run_audio();
        session.frame(216);

        let error = session.audio().error().unwrap();
        assert_eq!(error.line, Some(1));
        assert_eq!(session.audio_editor().markers().len(), 1);
        assert_eq!(
            session.audio().executor().runtime().running_code(),
            Some("out: sig 0.1")
        );

        assert!(session.revert_audio());
        assert_eq!(session.audio_editor().value(), "out: sig 0.1");
        assert!(session.audio_editor().markers().is_empty());
    }

    #[test]
    fn test_queued_failure_does_not_retarget_highlights() {
        let mut session = session();
        session.interaction(InteractionKind::Click);
        session.audio_editor_mut().set_value("out: seq 60 >> sin");
        session.force_run_audio();
        session
            .audio_editor_mut()
            .set_value("out: seq 72 >> sin >> bogus");
        session.force_run_audio();

        session.frame(0);
        session.frame(200);
        assert_eq!(
            session.audio().executor().runtime().running_code(),
            Some("out: seq 60 >> sin")
        );
        assert_eq!(session.audio().error().unwrap().message, "unknown node `bogus`");
        assert!(session.audio_editor().decorated_text().is_empty());

        // The failure arrived inside the confirmation window, so nothing is promoted
        session.frame(1000);
        assert_eq!(session.audio().state().last_working_code(), None);

        assert!(!session.revert_audio());
        session.audio_editor_mut().set_value("out: seq 60 >> sin");
        session.frame(1016);
        assert_eq!(session.audio_editor().decorated_text(), vec!["60".to_string()]);
    }

    #[test]
    fn test_success_confirms_evaluated_code() {
        let mut session = session();
        session.interaction(InteractionKind::Click);
        session.audio_editor_mut().set_value("out: seq 60 >> sin");
        session.force_run_audio();
        session.frame(0);

        session.audio_editor_mut().set_value("out: seq 62 >> sin");
        session.audio_edited(10);
        session.frame(200);
        assert_eq!(
            session.audio().state().last_working_code(),
            Some("out: seq 60 >> sin")
        );
    }

    #[test]
    fn test_saved_code_is_restored() {
        let store = Arc::new(MemoryStore::new());
        store.save("visual", "out: sig 3").unwrap();
        store.save("audio", "out: sin 110").unwrap();

        let session = LiveSession::new(
            SharedSettings::new(Settings::default()),
            store,
            TextModel::new(""),
            TextModel::new(""),
        )
        .unwrap();
        assert_eq!(session.visual_editor().value(), "out: sig 3");
        assert_eq!(session.audio_editor().value(), "out: sin 110");
    }

    #[test]
    fn test_reload_replaces_context_and_reruns() {
        let mut session = session();
        session.visual_editor_mut().set_value("out: sig 0");
        session.force_run_visual();
        let first = session.visual().executor().context_id();
        run_until(&mut session, 0, |s| {
            s.visual().state().last_working_code().is_some()
        });

        session.reload().unwrap();
        assert_ne!(session.visual().executor().context_id(), first);
        assert_eq!(session.visual().executor().pending_code(), Some("out: sig 0"));
        run_until(&mut session, 10_000, |s| s.visual().executor().pending_code().is_none());
    }

    /// Reports the size of the first analyser frame it receives.
    #[derive(Default)]
    struct AudioProbe {
        heard: Option<usize>,
        reported: bool,
    }

    impl Runtime for AudioProbe {
        fn evaluate(&mut self, _code: &str) -> Result<(), RuntimeFault> {
            Ok(())
        }

        fn soft_reset(&mut self) {}

        fn on_audio(&mut self, frame: &crate::analysis::AudioFrame) {
            self.heard.get_or_insert(frame.waveform.len());
        }

        fn poll_faults(&mut self) -> Vec<ParamFault> {
            match self.heard {
                Some(len) if !self.reported => {
                    self.reported = true;
                    vec![ParamFault {
                        message: format!("heard {len} samples"),
                        param_name: None,
                    }]
                }
                _ => Vec::new(),
            }
        }
    }

    #[test]
    fn test_audio_frames_reach_visual_context() {
        let mut registry = RuntimeRegistry::new();
        registry.register("probe", || Box::<AudioProbe>::default() as Box<dyn Runtime>);
        let mut session = LiveSession::with_sandbox(
            SharedSettings::default(),
            Arc::new(MemoryStore::new()),
            registry,
            Bootstrap::new("probe"),
            TextModel::new("visual"),
            TextModel::new("out: sin 220"),
        )
        .unwrap();
        let (_, frames) = session.bridge_mut().subscribe();

        session.interaction(InteractionKind::TouchStart);
        session.force_run_audio();
        session.force_run_visual();
        run_until(&mut session, 0, |s| s.visual().error().is_some());

        let error = session.visual().error().unwrap();
        assert_eq!(error.message, "heard 2048 samples");
        assert_eq!(error.kind, crate::error::ErrorKind::Parameter);

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.fft.len(), 1024);
        assert_eq!(frame.waveform.len(), 2048);
    }

    #[test]
    fn test_shutdown_clears_highlights() {
        let mut session = session();
        session.interaction(InteractionKind::Click);
        session.audio_editor_mut().set_value("out: seq 60 >> sin");
        session.force_run_audio();
        session.frame(0);
        assert_eq!(session.audio_editor().decoration_count(), 1);

        session.shutdown();
        session.shutdown();
        assert_eq!(session.audio_editor().decoration_count(), 0);
        assert!(!session.highlighter().is_running());
    }
}
