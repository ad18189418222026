//! Debounced execution controller
//!
//! One controller per runtime. Edits are persisted and coalesced by a
//! trailing debounce; force-runs bypass it. Every successful run arms a short
//! confirmation timer, and only a run whose timer fires without an error in
//! between is promoted to "last working" code, which the user can revert to.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{SettingsSource, CONFIRMATION_DELAY_MS};
use crate::editor::{Editor, Marker, Position, Severity};
use crate::error::CodeError;
use crate::store::CodeStore;
use crate::timer::{Millis, Timer};

/// Identifies a runtime instance. Errors carry it so feedback reaches the
/// controller that issued the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(pub &'static str);

impl RuntimeId {
    pub const VISUAL: RuntimeId = RuntimeId("visual");
    pub const AUDIO: RuntimeId = RuntimeId("audio");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Where execution requests go. Sends are fire-and-forget; results come back
/// later through `on_run_ok` / `on_error`.
pub trait Executor {
    fn execute(&mut self, code: &str);

    /// Clear accumulated runtime counters, then run `code`.
    fn soft_reset(&mut self, code: &str);

    /// Unlock output that needs a user gesture. Returns false if it failed.
    fn init_audio(&mut self) -> bool {
        true
    }

    fn requires_unlock(&self) -> bool {
        false
    }
}

/// User gestures that may unlock audio output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Click,
    KeyDown,
    TouchStart,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 3] = [
        InteractionKind::Click,
        InteractionKind::KeyDown,
        InteractionKind::TouchStart,
    ];
}

/// The set of interaction listeners waiting to unlock audio. All of them are
/// removed together once unlocking succeeds.
#[derive(Debug, Clone, Default)]
pub struct UnlockGate {
    listening: Vec<InteractionKind>,
}

impl UnlockGate {
    pub fn new(armed: bool) -> Self {
        Self {
            listening: if armed {
                InteractionKind::ALL.to_vec()
            } else {
                Vec::new()
            },
        }
    }

    pub fn is_listening(&self, kind: InteractionKind) -> bool {
        self.listening.contains(&kind)
    }

    pub fn is_armed(&self) -> bool {
        !self.listening.is_empty()
    }

    fn disarm(&mut self) {
        self.listening.clear();
    }
}

/// Per-runtime confirmation state.
///
/// The confirmation timer's payload is the pending working code, so a
/// pending run is either promoted or discarded, never both.
#[derive(Debug, Default)]
pub struct RuntimeState {
    last_working_code: Option<String>,
    confirmation: Timer<String>,
    is_initialized: bool,
}

impl RuntimeState {
    pub fn last_working_code(&self) -> Option<&str> {
        self.last_working_code.as_deref()
    }

    pub fn pending_working_code(&self) -> Option<&str> {
        self.confirmation.payload().map(String::as_str)
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

pub struct ExecutionController<X: Executor> {
    id: RuntimeId,
    executor: X,
    settings: Arc<dyn SettingsSource>,
    store: Arc<dyn CodeStore>,
    state: RuntimeState,
    /// Payload is the code snapshot of the latest edit
    debounce: Timer<String>,
    last_executed: Option<String>,
    error: Option<CodeError>,
    unlock: UnlockGate,
}

impl<X: Executor> ExecutionController<X> {
    pub fn new(
        id: RuntimeId,
        executor: X,
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn CodeStore>,
    ) -> Self {
        let needs_unlock = executor.requires_unlock();
        Self {
            id,
            executor,
            settings,
            store,
            state: RuntimeState {
                is_initialized: !needs_unlock,
                ..RuntimeState::default()
            },
            debounce: Timer::new(),
            last_executed: None,
            error: None,
            unlock: UnlockGate::new(needs_unlock),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut X {
        &mut self.executor
    }

    /// The error currently shown to the user, if any
    pub fn error(&self) -> Option<&CodeError> {
        self.error.as_ref()
    }

    /// Code of the most recent execution request
    pub fn last_executed(&self) -> Option<&str> {
        self.last_executed.as_deref()
    }

    pub fn is_debounce_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    pub fn unlock_gate(&self) -> &UnlockGate {
        &self.unlock
    }

    /// Code persisted for this runtime by an earlier session
    pub fn saved_code(&self) -> Option<String> {
        self.store.load(self.id.as_str())
    }

    fn persist(&self, code: &str) {
        if let Err(err) = self.store.save(self.id.as_str(), code) {
            warn!(runtime = %self.id, %err, "failed to persist code");
        }
    }

    fn run(&mut self, code: String, soft: bool) {
        if self.executor.requires_unlock() && !self.state.is_initialized {
            self.handle_init_audio();
        }
        if soft {
            self.executor.soft_reset(&code);
        } else {
            self.executor.execute(&code);
        }
        self.last_executed = Some(code);
    }

    /// Persist `code` and, with auto-execute on, restart the debounce.
    pub fn handle_code_change(&mut self, now: Millis, code: &str) {
        self.persist(code);
        if self.settings.auto_execute() {
            let delay = self.settings.auto_execute_delay_ms();
            self.debounce.schedule(now, delay, code.to_string());
        } else {
            self.debounce.cancel();
        }
    }

    /// Run the editor's content now, cancelling any pending debounce first.
    pub fn handle_force_run(&mut self, editor: &mut dyn Editor) {
        self.debounce.cancel();
        self.dismiss_error(editor);
        self.run(editor.value(), false);
    }

    /// Like `handle_force_run` but resets runtime counters before running.
    pub fn handle_soft_reset(&mut self, editor: &mut dyn Editor) {
        self.debounce.cancel();
        self.dismiss_error(editor);
        self.run(editor.value(), true);
    }

    /// Restore the last working code and run it. Returns false if there is none.
    pub fn handle_revert_to_last_working(&mut self, editor: &mut dyn Editor) -> bool {
        let Some(code) = self.state.last_working_code.clone() else {
            return false;
        };
        editor.set_value(&code);
        self.persist(&code);
        self.handle_force_run(editor);
        true
    }

    /// The most recent run succeeded: start confirming it.
    pub fn on_run_ok(&mut self, now: Millis, editor: &mut dyn Editor) {
        let Some(code) = self.last_executed.clone() else {
            self.dismiss_error(editor);
            debug!(runtime = %self.id, "success signal with nothing executed");
            return;
        };
        self.on_run_ok_for(now, code, editor);
    }

    /// A run of `code` succeeded: start confirming it, replacing any pending
    /// confirmation. For executors that report which code they evaluated.
    pub fn on_run_ok_for(&mut self, now: Millis, code: String, editor: &mut dyn Editor) {
        self.dismiss_error(editor);
        self.state
            .confirmation
            .schedule(now, CONFIRMATION_DELAY_MS, code);
    }

    /// Surface an error and veto the pending confirmation.
    pub fn on_error(&mut self, error: CodeError, editor: &mut dyn Editor) {
        if error.source != self.id {
            debug!(runtime = %self.id, source = %error.source, "ignoring error from another runtime");
            return;
        }
        if self.state.confirmation.cancel().is_some() {
            debug!(runtime = %self.id, "pending working code discarded");
        }

        info!(runtime = %self.id, line = ?error.line, column = ?error.column, "{}", error.message);
        let marker = Marker {
            position: Position::new(error.line.unwrap_or(1), error.column.unwrap_or(1)),
            message: error.message.clone(),
            severity: Severity::Error,
        };
        editor.set_markers(&[marker]);
        self.error = Some(error);
    }

    /// Fire whichever timers are due at `now`.
    pub fn poll(&mut self, now: Millis) {
        if let Some(code) = self.state.confirmation.take_due(now) {
            debug!(runtime = %self.id, "working code confirmed");
            self.state.last_working_code = Some(code);
        }
        if let Some(code) = self.debounce.take_due(now) {
            self.run(code, false);
        }
    }

    pub fn dismiss_error(&mut self, editor: &mut dyn Editor) {
        self.error = None;
        editor.clear_markers();
    }

    /// Initialize gated output once. Later calls are no-ops returning false.
    pub fn handle_init_audio(&mut self) -> bool {
        if self.state.is_initialized {
            return false;
        }
        if !self.executor.init_audio() {
            warn!(runtime = %self.id, "audio initialization failed");
            return false;
        }
        self.state.is_initialized = true;
        self.unlock.disarm();
        true
    }

    /// A user gesture happened; unlocks audio on the first listened-for one.
    pub fn handle_interaction(&mut self, kind: InteractionKind) -> bool {
        if !self.unlock.is_listening(kind) {
            return false;
        }
        self.handle_init_audio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, SharedSettings};
    use crate::editor::TextModel;
    use crate::error::RuntimeFault;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Run(String),
        Reset(String),
        Init,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        gated: bool,
    }

    impl Recorder {
        fn runs(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Run(code) | Call::Reset(code) => Some(code.as_str()),
                    Call::Init => None,
                })
                .collect()
        }
    }

    impl Executor for Recorder {
        fn execute(&mut self, code: &str) {
            self.calls.push(Call::Run(code.to_string()));
        }

        fn soft_reset(&mut self, code: &str) {
            self.calls.push(Call::Reset(code.to_string()));
        }

        fn init_audio(&mut self) -> bool {
            self.calls.push(Call::Init);
            true
        }

        fn requires_unlock(&self) -> bool {
            self.gated
        }
    }

    fn controller_with(settings: Settings, gated: bool) -> ExecutionController<Recorder> {
        ExecutionController::new(
            RuntimeId::VISUAL,
            Recorder {
                calls: Vec::new(),
                gated,
            },
            Arc::new(SharedSettings::new(settings)),
            Arc::new(MemoryStore::new()),
        )
    }

    fn controller() -> ExecutionController<Recorder> {
        controller_with(Settings::default(), false)
    }

    fn synth_error(source: RuntimeId) -> CodeError {
        CodeError::parameter(source, "uniform blew up".into(), Some("level".into()))
    }

    #[test]
    fn test_edits_coalesce_into_one_run() {
        let mut ctl = controller();
        ctl.handle_code_change(0, "a");
        ctl.handle_code_change(100, "ab");
        ctl.handle_code_change(150, "abc");

        ctl.poll(649);
        assert!(ctl.executor().runs().is_empty());
        ctl.poll(650);
        assert_eq!(ctl.executor().runs(), vec!["abc"]);
        ctl.poll(10_000);
        assert_eq!(ctl.executor().runs().len(), 1);
    }

    #[test]
    fn test_edits_are_persisted() {
        let mut ctl = controller();
        ctl.handle_code_change(0, "saved");
        assert_eq!(ctl.saved_code().as_deref(), Some("saved"));
    }

    #[test]
    fn test_auto_execute_off_schedules_nothing() {
        let settings = SharedSettings::new(Settings::default());
        let mut ctl = ExecutionController::new(
            RuntimeId::VISUAL,
            Recorder::default(),
            Arc::new(settings.clone()),
            Arc::new(MemoryStore::new()),
        );
        ctl.handle_code_change(0, "a");
        settings.update(|s| s.auto_execute = false);
        ctl.handle_code_change(10, "ab");

        assert!(!ctl.is_debounce_pending());
        ctl.poll(5_000);
        assert!(ctl.executor().runs().is_empty());
    }

    #[test]
    fn test_force_run_preempts_debounce() {
        let mut ctl = controller();
        let mut editor = TextModel::new("typed");
        ctl.handle_code_change(0, "typed");
        ctl.handle_force_run(&mut editor);

        assert!(!ctl.is_debounce_pending());
        ctl.poll(10_000);
        assert_eq!(ctl.executor().runs(), vec!["typed"]);
    }

    #[test]
    fn test_force_run_clears_error_and_markers() {
        let mut ctl = controller();
        let mut editor = TextModel::new("code");
        ctl.on_error(synth_error(RuntimeId::VISUAL), &mut editor);
        assert!(ctl.error().is_some());
        assert_eq!(editor.markers().len(), 1);

        ctl.handle_force_run(&mut editor);
        assert!(ctl.error().is_none());
        assert!(editor.markers().is_empty());
    }

    #[test]
    fn test_confirmation_promotes_after_delay() {
        let mut ctl = controller();
        let mut editor = TextModel::new("X");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(0, &mut editor);
        assert_eq!(ctl.state().pending_working_code(), Some("X"));

        ctl.poll(CONFIRMATION_DELAY_MS - 1);
        assert_eq!(ctl.state().last_working_code(), None);
        ctl.poll(CONFIRMATION_DELAY_MS);
        assert_eq!(ctl.state().last_working_code(), Some("X"));
        assert_eq!(ctl.state().pending_working_code(), None);
    }

    #[test]
    fn test_error_within_delay_vetoes_promotion() {
        let mut ctl = controller();
        let mut editor = TextModel::new("good");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(0, &mut editor);
        ctl.poll(CONFIRMATION_DELAY_MS);
        assert_eq!(ctl.state().last_working_code(), Some("good"));

        editor.set_value("X");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(1_000, &mut editor);
        ctl.poll(1_040);
        ctl.on_error(synth_error(RuntimeId::VISUAL), &mut editor);
        ctl.poll(5_000);

        assert_eq!(ctl.state().last_working_code(), Some("good"));
        assert_eq!(ctl.state().pending_working_code(), None);
        assert!(ctl.error().unwrap().message.ends_with("(~level)"));
    }

    #[test]
    fn test_second_success_restarts_confirmation() {
        let mut ctl = controller();
        let mut editor = TextModel::new("X");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(0, &mut editor);

        editor.set_value("Y");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(50, &mut editor);
        assert_eq!(ctl.state().pending_working_code(), Some("Y"));

        ctl.poll(CONFIRMATION_DELAY_MS);
        assert_eq!(ctl.state().last_working_code(), None);
        ctl.poll(50 + CONFIRMATION_DELAY_MS - 1);
        assert_eq!(ctl.state().last_working_code(), None);
        ctl.poll(50 + CONFIRMATION_DELAY_MS);
        assert_eq!(ctl.state().last_working_code(), Some("Y"));
    }

    #[test]
    fn test_success_for_explicit_code_confirms_that_code() {
        let mut ctl = controller();
        let mut editor = TextModel::new("good");
        ctl.handle_force_run(&mut editor);
        editor.set_value("newer");
        ctl.handle_force_run(&mut editor);
        assert_eq!(ctl.last_executed(), Some("newer"));

        ctl.on_run_ok_for(0, "good".to_string(), &mut editor);
        assert_eq!(ctl.state().pending_working_code(), Some("good"));
        ctl.poll(CONFIRMATION_DELAY_MS);
        assert_eq!(ctl.state().last_working_code(), Some("good"));
    }

    #[test]
    fn test_errors_from_other_runtimes_are_ignored() {
        let mut ctl = controller();
        let mut editor = TextModel::new("X");
        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(0, &mut editor);
        ctl.on_error(synth_error(RuntimeId::AUDIO), &mut editor);
        ctl.poll(CONFIRMATION_DELAY_MS);

        assert!(ctl.error().is_none());
        assert_eq!(ctl.state().last_working_code(), Some("X"));
    }

    #[test]
    fn test_error_marker_defaults_to_first_line() {
        let mut ctl = controller();
        let mut editor = TextModel::new("X");
        let located = CodeError::execution(
            RuntimeId::VISUAL,
            RuntimeFault::new("unexpected token").at(3, 7),
        );
        ctl.on_error(located, &mut editor);
        assert_eq!(editor.markers()[0].position, Position::new(3, 7));

        ctl.on_error(synth_error(RuntimeId::VISUAL), &mut editor);
        assert_eq!(editor.markers()[0].position, Position::new(1, 1));
        assert_eq!(editor.markers().len(), 1);
    }

    #[test]
    fn test_revert_to_last_working() {
        let mut ctl = controller();
        let mut editor = TextModel::new("good");
        assert!(!ctl.handle_revert_to_last_working(&mut editor));

        ctl.handle_force_run(&mut editor);
        ctl.on_run_ok(0, &mut editor);
        ctl.poll(CONFIRMATION_DELAY_MS);

        editor.set_value("broken");
        ctl.handle_code_change(200, "broken");
        assert!(ctl.handle_revert_to_last_working(&mut editor));

        assert_eq!(editor.value(), "good");
        assert_eq!(ctl.saved_code().as_deref(), Some("good"));
        assert!(!ctl.is_debounce_pending());
        assert_eq!(ctl.executor().runs(), vec!["good", "good"]);
    }

    #[test]
    fn test_soft_reset_sends_reset() {
        let mut ctl = controller();
        let mut editor = TextModel::new("code");
        ctl.handle_soft_reset(&mut editor);
        assert_eq!(ctl.executor().calls, vec![Call::Reset("code".into())]);
    }

    #[test]
    fn test_init_audio_once() {
        let mut ctl = controller_with(Settings::default(), true);
        assert!(!ctl.state().is_initialized());
        assert!(ctl.unlock_gate().is_armed());

        assert!(ctl.handle_interaction(InteractionKind::KeyDown));
        assert!(!ctl.unlock_gate().is_armed());
        assert!(!ctl.handle_interaction(InteractionKind::Click));
        assert!(!ctl.handle_init_audio());
        assert_eq!(ctl.executor().calls, vec![Call::Init]);
    }

    #[test]
    fn test_run_before_unlock_initializes_first() {
        let mut ctl = controller_with(Settings::default(), true);
        let mut editor = TextModel::new("beat");
        ctl.handle_force_run(&mut editor);
        assert_eq!(
            ctl.executor().calls,
            vec![Call::Init, Call::Run("beat".into())]
        );
    }

    #[test]
    fn test_ungated_runtime_ignores_interactions() {
        let mut ctl = controller();
        assert!(ctl.state().is_initialized());
        assert!(!ctl.handle_interaction(InteractionKind::Click));
        assert!(ctl.executor().calls.is_empty());
    }

    proptest! {
        #[test]
        fn test_any_burst_runs_last_edit_once(
            gaps in prop::collection::vec(0u64..500, 1..20),
            delay in 1u64..1000,
        ) {
            let settings = Settings {
                auto_execute_delay_ms: delay,
                ..Settings::default()
            };
            let mut ctl = controller_with(settings, false);
            let mut now = 0;
            let mut last = String::new();
            for (i, gap) in gaps.iter().enumerate() {
                // Only gaps shorter than the delay stay inside one window
                now += gap % delay;
                last = format!("edit {i}");
                ctl.handle_code_change(now, &last);
                ctl.poll(now);
            }
            prop_assert!(ctl.executor().runs().is_empty());
            ctl.poll(now + delay);
            prop_assert_eq!(ctl.executor().runs(), vec![last.as_str()]);
        }

        #[test]
        fn test_force_run_never_doubles(
            edit_at in 0u64..1000,
            force_after in 0u64..1000,
        ) {
            let mut ctl = controller();
            let mut editor = TextModel::new("code");
            ctl.handle_code_change(edit_at, "code");
            let force_at = edit_at + force_after % Settings::default().auto_execute_delay_ms;
            ctl.poll(force_at);
            ctl.handle_force_run(&mut editor);
            ctl.poll(force_at + 10_000);
            prop_assert_eq!(ctl.executor().runs().len(), 1);
        }
    }
}
