use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rhai::{CallFnOptions, Dynamic, Engine, Map, Scope, AST};

use crate::capability::dispatch::{EventDispatcher, HandlerCall};
use crate::capability::SchedulerCapability;
use crate::compile::CompiledArtifact;
use crate::error::flatten_eval_error;

pub type FaultHook = Arc<dyn Fn(String) + Send + Sync>;

pub struct InstanceState {
    this: Dynamic,
    scope: Scope<'static>,
}

/// One instantiated module. Every call into it is serialized and runs with `this` bound to the
/// instance object.
pub struct ModuleInstance {
    script: String,
    entry_type: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    state: Mutex<InstanceState>,
    dispatcher: Arc<EventDispatcher>,
    scheduler: SchedulerCapability,
    fault_hook: RwLock<Option<FaultHook>>,
    faults: AtomicU64,
}

impl ModuleInstance {
    /// Constructs the entry type: its constructor function when defined, else an empty object.
    pub fn instantiate(
        script: &str,
        engine: Arc<Engine>,
        artifact: &CompiledArtifact,
        dispatcher: Arc<EventDispatcher>,
        scheduler: SchedulerCapability,
    ) -> Result<Arc<Self>, String> {
        let ast = artifact.ast();
        let constructor = artifact.entry_type().rsplit('.').next().unwrap_or_default().to_string();
        let mut scope = Scope::new();
        let this = if defines(&ast, &constructor, 0) {
            let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                engine.call_fn_with_options::<Dynamic>(options, &mut scope, &ast, &constructor, ())
            }));
            match outcome {
                Ok(Ok(value)) if value.is_unit() => Dynamic::from_map(Map::new()),
                Ok(Ok(value)) => value,
                Ok(Err(err)) => {
                    return Err(format!(
                        "constructing {}: {}",
                        artifact.entry_type(),
                        flatten_eval_error(&err)
                    ))
                }
                Err(panic) => return Err(format!("constructing {}: {}", artifact.entry_type(), panic_text(panic))),
            }
        } else {
            Dynamic::from_map(Map::new())
        };
        let module = Arc::new(Self {
            script: script.to_string(),
            entry_type: artifact.entry_type().to_string(),
            engine,
            ast,
            state: Mutex::new(InstanceState { this, scope }),
            dispatcher: dispatcher.clone(),
            scheduler,
            fault_hook: RwLock::new(None),
            faults: AtomicU64::new(0),
        });
        dispatcher.bind(&module);
        Ok(module)
    }

    pub fn entry_type(&self) -> &str {
        &self.entry_type
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn set_fault_hook(&self, hook: FaultHook) {
        *self.fault_hook.write() = Some(hook);
    }

    pub fn defines(&self, name: &str, arity: usize) -> bool {
        defines(&self.ast, name, arity)
    }

    /// Calls a module function, waiting for any call already in progress.
    pub fn call(&self, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, String> {
        let mut state = self.state.lock();
        let outcome = self.invoke(&mut state, name, args);
        drop(state);
        self.dispatcher.drain();
        outcome
    }

    /// Like [`ModuleInstance::call`], but a function the module does not define is skipped.
    pub fn call_if_defined(&self, name: &str, args: Vec<Dynamic>) -> Result<(), String> {
        if !self.defines(name, args.len()) {
            return Ok(());
        }
        self.call(name, args).map(|_| ())
    }

    /// Runs up to `budget` microthread steps. Skipped entirely while another call holds the module.
    pub fn tick(&self, budget: u32) -> u32 {
        if !self.scheduler.is_live() {
            return 0;
        }
        let Some(mut state) = self.state.try_lock() else {
            return 0;
        };
        let mut steps = 0;
        while steps < budget {
            let Some(thread) = self.scheduler.next_ready() else { break };
            steps += 1;
            match self.invoke(&mut state, &thread.handler, Vec::new()) {
                Ok(value) if value.as_bool() == Ok(true) => self.scheduler.resume(thread),
                Ok(_) => self.scheduler.finish(&thread),
                Err(text) => {
                    self.scheduler.finish(&thread);
                    drop(state);
                    self.report_fault(format!("microthread '{}' failed: {text}", thread.handler));
                    self.dispatcher.drain();
                    return steps;
                }
            }
        }
        drop(state);
        self.dispatcher.drain();
        steps
    }

    pub(crate) fn try_lock_state(&self) -> Option<MutexGuard<'_, InstanceState>> {
        self.state.try_lock()
    }

    pub(crate) fn run_handler_locked(&self, state: &mut InstanceState, call: HandlerCall) {
        if let Err(text) = self.invoke(state, &call.handler, call.args) {
            self.report_fault(format!("{} handler '{}' failed: {text}", call.source, call.handler));
        }
    }

    pub(crate) fn run_handler(&self, call: HandlerCall) {
        let mut state = self.state.lock();
        self.run_handler_locked(&mut state, call);
    }

    /// Detaches the instance from event delivery and scheduling.
    pub fn close(&self) {
        self.dispatcher.close();
        self.scheduler.clear();
        self.fault_hook.write().take();
    }

    fn invoke(&self, state: &mut InstanceState, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, String> {
        if !defines(&self.ast, name, args.len()) {
            return Err(format!("{} does not define {name} with {} parameter(s)", self.entry_type, args.len()));
        }
        let InstanceState { this, scope } = state;
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(this);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.call_fn_with_options::<Dynamic>(options, scope, &self.ast, name, args)
        }));
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(flatten_eval_error(&err)),
            Err(panic) => Err(panic_text(panic)),
        }
    }

    fn report_fault(&self, text: String) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::error!("[mrm:{}] {text}", self.script);
        let hook = self.fault_hook.read().clone();
        if let Some(hook) = hook {
            hook(text);
        }
    }
}

fn defines(ast: &AST, name: &str, arity: usize) -> bool {
    ast.iter_functions().any(|f| f.name == name && f.params.len() == arity)
}

fn panic_text(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panic: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panic: {text}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
