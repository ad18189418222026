//! Thread-backed isolated contexts
//!
//! Each context is a worker thread that owns its runtime outright. The host
//! and the worker share no state: code goes in and results come out as JSON
//! payloads over crossbeam channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::analysis::AudioFrame;
use crate::channel::{Bootstrap, ContextFactory, ContextHandle};
use crate::config::Settings;
use crate::engine::ChainRuntime;
use crate::error::{ChannelError, SandboxError};
use crate::messages::{ContextId, Direction, Envelope, Message};
use crate::runtime::Runtime;

/// Idle tick: how often a worker advances its runtime and checks for faults
pub const DEFAULT_FRAME: Duration = Duration::from_millis(16);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type RuntimeFactory = Arc<dyn Fn() -> Box<dyn Runtime> + Send + Sync>;

/// Runtimes a sandbox can boot, keyed by bootstrap resource.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    factories: HashMap<String, RuntimeFactory>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `"glicol"` chain runtime.
    pub fn with_defaults(settings: &Settings) -> Self {
        let settings = settings.clone();
        let mut registry = Self::new();
        registry.register("glicol", move || {
            Box::new(ChainRuntime::from_settings(&settings)) as Box<dyn Runtime>
        });
        registry
    }

    pub fn register<F>(&mut self, resource: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Runtime> + Send + Sync + 'static,
    {
        self.factories.insert(resource.into(), Arc::new(factory));
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.factories.contains_key(resource)
    }

    fn get(&self, resource: &str) -> Option<RuntimeFactory> {
        self.factories.get(resource).cloned()
    }
}

/// [`ContextFactory`] whose contexts post everything to one host inbox.
pub struct ThreadSandbox {
    outbox: Sender<Envelope>,
    registry: RuntimeRegistry,
    frame: Duration,
}

impl ThreadSandbox {
    pub fn new(outbox: Sender<Envelope>, registry: RuntimeRegistry) -> Self {
        Self {
            outbox,
            registry,
            frame: DEFAULT_FRAME,
        }
    }

    pub fn with_frame(mut self, frame: Duration) -> Self {
        self.frame = frame;
        self
    }
}

impl ContextFactory for ThreadSandbox {
    fn create(&mut self, bootstrap: &Bootstrap) -> Result<Box<dyn ContextHandle>, ChannelError> {
        if !bootstrap.capabilities.scripts {
            return Err(SandboxError::ScriptsDisabled(bootstrap.resource.clone()).into());
        }
        let factory = self
            .registry
            .get(&bootstrap.resource)
            .ok_or_else(|| SandboxError::UnknownResource(bootstrap.resource.clone()))?;

        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, inbox) = unbounded();
        let worker = Worker {
            id,
            inbox,
            outbox: self.outbox.clone(),
            frame: self.frame,
        };
        let handle = thread::Builder::new()
            .name(format!("sandbox-{}", id.0))
            .spawn(move || worker.run(factory()))
            .map_err(SandboxError::from)?;

        Ok(Box::new(ThreadContext {
            id,
            sender: Some(sender),
            worker: Some(handle),
        }))
    }
}

struct ThreadContext {
    id: ContextId,
    sender: Option<Sender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl ContextHandle for ThreadContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post(&self, payload: String) -> Result<(), ChannelError> {
        let sender = self.sender.as_ref().ok_or(ChannelError::ContextGone(self.id.0))?;
        sender
            .send(payload)
            .map_err(|_| ChannelError::ContextGone(self.id.0))
    }

    fn destroy(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Disconnecting the inbox ends the worker loop
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(context = %self.id, "sandbox worker panicked");
            }
        }
    }
}

struct Worker {
    id: ContextId,
    inbox: Receiver<String>,
    outbox: Sender<Envelope>,
    frame: Duration,
}

impl Worker {
    /// False once the host has gone away.
    fn post(&self, message: Message) -> bool {
        match message.encode() {
            Ok(payload) => self
                .outbox
                .send(Envelope {
                    origin: self.id,
                    payload,
                })
                .is_ok(),
            Err(err) => {
                warn!(context = %self.id, %err, "could not encode message");
                true
            }
        }
    }

    fn evaluate(&self, runtime: &mut dyn Runtime, code: &str, started: Instant) -> bool {
        let reply = match runtime.evaluate(code) {
            Ok(()) => Message::RunOk {
                timestamp: started.elapsed().as_secs_f64() * 1000.0,
            },
            Err(fault) => {
                info!(context = %self.id, line = ?fault.line, "{}", fault.message);
                Message::run_error(fault)
            }
        };
        self.post(reply)
    }

    fn run(self, mut runtime: Box<dyn Runtime>) {
        let started = Instant::now();
        if !self.post(Message::Ready) {
            return;
        }

        let mut last_tick = started;
        loop {
            let payload = match self.inbox.recv_deadline(last_tick + self.frame) {
                Ok(payload) => payload,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    runtime.advance(now - last_tick);
                    last_tick = now;
                    for fault in runtime.poll_faults() {
                        let message = Message::SynthError {
                            message: fault.message,
                            param_name: fault.param_name,
                        };
                        if !self.post(message) {
                            return;
                        }
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let message = match Message::decode_from(&payload, Direction::HostToSandbox) {
                Ok(message) => message,
                Err(err) => {
                    debug!(context = %self.id, %err, "dropping malformed message");
                    continue;
                }
            };
            let alive = match message {
                Message::RunCode { code } => self.evaluate(runtime.as_mut(), &code, started),
                Message::SoftReset { code } => {
                    runtime.soft_reset();
                    self.evaluate(runtime.as_mut(), &code, started)
                }
                Message::AudioData {
                    fft,
                    waveform,
                    timestamp,
                } => {
                    runtime.on_audio(&AudioFrame {
                        fft,
                        waveform,
                        timestamp,
                    });
                    true
                }
                _ => true,
            };
            if !alive {
                return;
            }
        }
        debug!(context = %self.id, "sandbox worker exiting");
    }
}
