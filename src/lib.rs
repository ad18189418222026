//! GlicolLive - execution and feedback pipeline for Glicol live coding
//!
//! Two runtimes are driven from two editors. Visual code runs in an isolated
//! sandbox context reached through a typed message channel; audio code runs
//! in-process on a chain runtime that renders blocks against a transport.
//! Each runtime has its own [`ExecutionController`] that debounces edits,
//! surfaces errors as editor markers and remembers the last working code.
//! The audio side also highlights the pattern steps that are sounding and
//! publishes analyser frames for audio-reactive visuals.
//!
//! [`LiveSession`] wires all of it together; hosts call
//! [`LiveSession::frame`] once per animation frame.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub mod analysis;
pub mod channel;
pub mod config;
pub mod controller;
pub mod dsp;
pub mod editor;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod messages;
pub mod pattern;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod timer;

pub use analysis::{AudioBridge, AudioFrame};
pub use channel::{Bootstrap, ChannelEvent, ChannelState, ExecutionChannel};
pub use config::{Settings, SharedSettings};
pub use controller::{ExecutionController, Executor, InteractionKind, RuntimeId};
pub use editor::{Editor, TextModel};
pub use engine::{ChainRuntime, LocalExecutor};
pub use error::{CodeError, RuntimeFault};
pub use highlight::PatternHighlighter;
pub use runtime::Runtime;
pub use sandbox::{RuntimeRegistry, ThreadSandbox};
pub use session::LiveSession;
pub use store::{CodeStore, FileStore, MemoryStore};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`. Later calls and
/// an already installed subscriber are both left alone.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                EnvFilter::new("warn,glicol_live=debug")
            } else {
                EnvFilter::new("warn")
            }
        });
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init()
            .ok();
    });
}
