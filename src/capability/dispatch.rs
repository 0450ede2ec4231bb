use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};

use crate::runtime::ModuleInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run on the submitting thread when the module is idle, otherwise hand the call to the
    /// thread that currently holds the module.
    #[default]
    Inline,
    /// A dedicated worker drains a FIFO.
    Queued,
}

/// One script-side handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerCall {
    pub source: &'static str,
    pub handler: String,
    pub args: Vec<Dynamic>,
}

impl HandlerCall {
    pub fn new(source: &'static str, handler: impl Into<String>, args: Vec<Dynamic>) -> Self {
        Self { source, handler: handler.into(), args }
    }
}

/// The single serialized entry point for events crossing into a module.
pub struct EventDispatcher {
    name: String,
    mode: DispatchMode,
    queue: Mutex<VecDeque<HandlerCall>>,
    target: RwLock<Option<Weak<ModuleInstance>>>,
    worker: Mutex<Option<Sender<HandlerCall>>>,
    closed: AtomicBool,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(name: &str, mode: DispatchMode) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mode,
            queue: Mutex::new(VecDeque::new()),
            target: RwLock::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn bind(&self, module: &Arc<ModuleInstance>) {
        *self.target.write() = Some(Arc::downgrade(module));
        if self.mode == DispatchMode::Queued {
            let (sender, receiver) = unbounded::<HandlerCall>();
            let weak = Arc::downgrade(module);
            let spawned = thread::Builder::new().name(format!("{} events", self.name)).spawn(move || {
                for call in receiver.iter() {
                    let Some(module) = weak.upgrade() else { break };
                    module.run_handler(call);
                }
            });
            match spawned {
                Ok(_) => *self.worker.lock() = Some(sender),
                Err(err) => {
                    tracing::error!("[mrm] {}: failed to spawn event worker ({err}), delivering inline", self.name)
                }
            }
        }
    }

    pub fn submit(&self, call: HandlerCall) {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = self.worker.lock().as_ref() {
            if sender.send(call).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        self.queue.lock().push_back(call);
        self.drain();
    }

    /// Runs queued calls while the module is free. Whoever holds the module calls this again
    /// after releasing it, so nothing submitted meanwhile is stranded.
    pub(crate) fn drain(&self) {
        let Some(module) = self.target.read().as_ref().and_then(Weak::upgrade) else {
            let stale = self.queue.lock().drain(..).count();
            self.dropped.fetch_add(stale as u64, Ordering::Relaxed);
            return;
        };
        loop {
            let Some(mut state) = module.try_lock_state() else {
                return;
            };
            let next = self.queue.lock().pop_front();
            match next {
                Some(call) => module.run_handler_locked(&mut state, call),
                None => {
                    drop(state);
                    if self.queue.lock().is_empty() {
                        return;
                    }
                }
            }
        }
    }

    /// Stops accepting events and forgets the module.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.target.write() = None;
        self.worker.lock().take();
        let stale = self.queue.lock().drain(..).count();
        if stale > 0 {
            self.dropped.fetch_add(stale as u64, Ordering::Relaxed);
            tracing::debug!("[mrm] {}: dropped {stale} undelivered event(s)", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
