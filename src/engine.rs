//! The per-region facade: observes module source, runs lifecycle work on the worker pool, ticks
//! scripts every frame and serves the command surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::capability::{CapabilityCounters, CounterSnapshot};
use crate::commands::{self, Command, CommandState, ParseOutcome, Target};
use crate::compile::declarations::{self, SourceKind};
use crate::compile::{ArtifactCache, Compiler};
use crate::config::EngineConfig;
use crate::error::ScriptError;
use crate::region::{ChatMessage, ListenerId, ObjectId, PrincipalId, RegionWorld, NO_PRINCIPAL};
use crate::registry::ScriptRegistry;
use crate::script::{Script, ScriptServices};
use crate::workers::WorkerPool;

pub const ENGINE_NAME: &str = "MiniRegionModule";
const CHAT_PREFIX: &str = "XMRM";

pub struct ScriptEngine {
    config: EngineConfig,
    region: Arc<dyn RegionWorld>,
    registry: Arc<ScriptRegistry>,
    services: Arc<ScriptServices>,
    workers: WorkerPool,
    commands: CommandState,
    /// Serializes host-driven starts against removals.
    start_lock: Arc<Mutex<()>>,
    frames: AtomicU64,
    chat_listener: Mutex<Option<ListenerId>>,
}

impl ScriptEngine {
    /// Builds an engine for `region`. Relative external module paths resolve against the current
    /// directory.
    pub fn new(config: EngineConfig, region: Arc<dyn RegionWorld>) -> Arc<Self> {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_working_dir(config, region, working_dir)
    }

    pub fn with_working_dir(config: EngineConfig, region: Arc<dyn RegionWorld>, working_dir: PathBuf) -> Arc<Self> {
        let registry = Arc::new(ScriptRegistry::new());
        let compiler = Arc::new(Compiler::new(
            config.artifact_root.clone(),
            region.region_id(),
            Arc::new(ArtifactCache::new()),
        ));
        let services = Arc::new(ScriptServices {
            region: region.clone(),
            compiler,
            registry: Arc::downgrade(&registry),
            counters: Arc::new(CapabilityCounters::default()),
            config: config.clone(),
            working_dir,
        });
        let engine = Arc::new(Self {
            workers: WorkerPool::new(&format!("{} mrm", region.region_name()), &config.workers),
            config,
            region,
            registry,
            services,
            commands: CommandState::new(),
            start_lock: Arc::new(Mutex::new(())),
            frames: AtomicU64::new(0),
            chat_listener: Mutex::new(None),
        });
        if engine.config.enabled {
            if !engine.config.hidden {
                engine.listen_for_chat();
            }
            tracing::info!("[MRM]: Loaded region '{}'.", engine.region.region_name());
        }
        engine
    }

    fn listen_for_chat(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.region.subscribe_chat(Arc::new(move |chat: &ChatMessage| {
            if let Some(engine) = weak.upgrade() {
                engine.on_chat(chat);
            }
        }));
        *self.chat_listener.lock() = Some(id);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.services.compiler
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.services.counters.snapshot()
    }

    pub fn script(&self, item: Uuid) -> Option<Arc<Script>> {
        self.registry.get(item)
    }

    pub fn script_by_name(&self, name: &str) -> Option<Arc<Script>> {
        self.registry.by_name(name)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn accepts(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Inline => self.config.enabled,
            SourceKind::External => self.config.enabled && self.config.external_enabled,
        }
    }

    fn create(&self, host_object: ObjectId, item: Uuid, item_name: &str, text: &str) -> Option<Arc<Script>> {
        match Script::create(self.services.clone(), item, host_object, item_name, text) {
            Ok(script) => Some(script),
            Err(err) => {
                tracing::warn!("[MRM]: Unable to create script for '{item_name}': {err}");
                None
            }
        }
    }

    /// Source for `item` was placed in or changed on `host_object`.
    pub fn on_script_rez(&self, host_object: ObjectId, item: Uuid, item_name: &str, text: &str) -> Option<Arc<Script>> {
        let kind = declarations::source_kind(text);
        let Some(existing) = self.registry.get(item) else {
            return match kind {
                Some(kind) if self.accepts(kind) => self.create(host_object, item, item_name, text),
                _ => None,
            };
        };
        match kind {
            None => {
                self.dispose_quietly(&existing);
                None
            }
            Some(kind) if kind != existing.kind() => {
                self.dispose_quietly(&existing);
                if self.accepts(kind) {
                    self.create(host_object, item, item_name, text)
                } else {
                    None
                }
            }
            Some(_) => {
                existing.set_source(text);
                Some(existing)
            }
        }
    }

    fn dispose_quietly(&self, script: &Script) {
        if let Err(err) = script.dispose(None) {
            tracing::warn!("[MRM]: Problem disposing {}: {err}", script.name());
        }
    }

    /// Queues a host-driven start.
    pub fn resume_script(&self, item: Uuid) -> bool {
        let Some(script) = self.registry.get(item) else { return false };
        let start_lock = self.start_lock.clone();
        self.workers.execute(move || {
            let _guard = start_lock.lock();
            if let Err(err) = script.start(None) {
                tracing::debug!("[MRM]: {err}");
            }
        })
    }

    /// Queues a host-driven reset.
    pub fn on_reset_script(&self, item: Uuid) -> bool {
        let Some(script) = self.registry.get(item) else { return false };
        self.queue_reset(script, None)
    }

    fn queue_reset(&self, script: Arc<Script>, requester: Option<PrincipalId>) -> bool {
        self.workers.execute(move || {
            if let Err(err) = script.reset(requester) {
                tracing::warn!("[MRM]: Unable to restart {}: {err}", script.name());
            }
        })
    }

    fn queue_start(&self, script: Arc<Script>, requester: Option<PrincipalId>) -> bool {
        self.workers.execute(move || {
            if let Err(err) = script.start(requester) {
                tracing::debug!("[MRM]: {err}");
            }
        })
    }

    fn queue_stop(&self, script: Arc<Script>, requester: Option<PrincipalId>) -> bool {
        self.workers.execute(move || {
            if let Err(err) = script.stop(requester) {
                tracing::debug!("[XMRM]: {err}");
            }
        })
    }

    fn queue_dispose(&self, script: Arc<Script>, requester: Option<PrincipalId>) -> bool {
        let start_lock = self.start_lock.clone();
        self.workers.execute(move || {
            let _guard = start_lock.lock();
            if let Err(err) = script.dispose(requester) {
                tracing::debug!("[XMRM]: {err}");
            }
        })
    }

    /// The source item was removed from its object.
    pub fn on_remove_script(&self, item: Uuid) -> bool {
        let Some(script) = self.registry.get(item) else { return false };
        let _guard = self.start_lock.lock();
        self.dispose_quietly(&script);
        true
    }

    /// One host frame: step every running script, renewing leases every `lease_sweep_frames`.
    pub fn on_frame(&self) -> u32 {
        let frame = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let sweep = self.config.lease_sweep_frames > 0 && frame % self.config.lease_sweep_frames == 0;
        let mut steps = 0;
        for (_, script) in self.registry.snapshot() {
            if script.is_running() {
                steps += script.tick(self.config.tick_budget);
            }
            if sweep {
                let reclaimed = script.sweep_leases();
                if reclaimed > 0 {
                    tracing::debug!("[MRM]: reclaimed {reclaimed} dead handles from {}", script.name());
                }
            }
        }
        steps
    }

    fn on_chat(&self, chat: &ChatMessage) {
        if chat.from_object {
            return;
        }
        let first = chat.message.split_whitespace().next().unwrap_or_default();
        if first.eq_ignore_ascii_case(CHAT_PREFIX) {
            self.run_command(&chat.message, chat.sender);
        }
    }

    /// Runs one command line for `requester`. Returns the lines it reported.
    pub fn run_command(&self, line: &str, requester: PrincipalId) -> Vec<String> {
        let region_name = self.region.region_name();
        let command = match Command::parse(line) {
            ParseOutcome::Command(command) => command,
            ParseOutcome::Missing => return self.report_warn("[XMRM]: Ignoring XMRM command. No command specified."),
            ParseOutcome::Unknown(other) => {
                return self.report_warn(&format!("{other} is not a valid XMRM command. Ignoring."));
            }
        };
        if !matches!(command, Command::Region(_)) && !self.commands.accepts_region(&region_name) {
            return Vec::new();
        }
        match command {
            Command::Select(script) => self.select(&script, requester),
            Command::Start(arg) => self.for_targets(requester, arg, "start", |script| {
                self.queue_start(script, Some(requester));
            }),
            Command::Restart(arg) => self.for_targets(requester, arg, "restart", |script| {
                self.queue_reset(script, Some(requester));
            }),
            Command::Stop(arg) => self.for_targets(requester, arg, "stop", |script| {
                self.queue_stop(script, Some(requester));
            }),
            Command::Dispose(arg) => self.for_targets(requester, arg, "dispose", |script| {
                self.queue_dispose(script, Some(requester));
            }),
            Command::List => self.list_scripts(requester),
            Command::Region(region) => {
                self.commands.set_region_filter(region);
                match self.commands.region_filter() {
                    Some(region) => self.report_warn(&format!("[XMRM]: Commands restricted to region '{region}'.")),
                    None => self.report_warn("[XMRM]: Commands affect every region."),
                }
            }
            Command::Stats => self.stats(),
        }
    }

    fn select(&self, script: &str, requester: PrincipalId) -> Vec<String> {
        if script.is_empty() {
            return self.report_warn("[XMRM]: Ignoring XMRM select command. No script specified.");
        }
        if commands::is_keyword(script, commands::ALL) {
            self.commands.select(requester, Some(commands::ALL.to_string()));
            self.report_warn("[MRM]: All scripts will be affected.")
        } else if commands::is_keyword(script, commands::NONE) {
            self.commands.select(requester, None);
            self.report_warn("[MRM]: Default script disabled.")
        } else if self.registry.contains_name(script) {
            self.commands.select(requester, Some(script.to_string()));
            self.report_warn(&format!("[MRM]: '{script}' selected."))
        } else {
            self.commands.select(requester, None);
            self.report_warn(&format!("[MRM]: Unable to select script. '{script}' is not a known script."))
        }
    }

    fn for_targets(
        &self,
        requester: PrincipalId,
        arg: Option<String>,
        verb: &str,
        apply: impl Fn(Arc<Script>),
    ) -> Vec<String> {
        match self.commands.target(requester, arg) {
            None => Vec::new(),
            Some(Target::All) => {
                for (_, script) in self.registry.snapshot() {
                    apply(script);
                }
                Vec::new()
            }
            Some(Target::Named(name)) => match self.registry.by_name(&name) {
                Some(script) => {
                    apply(script);
                    Vec::new()
                }
                None => self.report_warn(&format!("[XMRM]: Unable to {verb} script. '{name}' is not a known script.")),
            },
        }
    }

    fn list_scripts(&self, requester: PrincipalId) -> Vec<String> {
        let scripts = self.registry.snapshot();
        let mut lines = vec![format!(
            "{} MRM scripts running in {}.",
            scripts.len(),
            self.region.region_name()
        )];
        if !scripts.is_empty() {
            lines.push(commands::list_row("Name", "Owner", "Running?"));
        }
        for (name, script) in scripts {
            if requester == NO_PRINCIPAL || script.owner() == requester {
                lines.push(commands::list_row(&name, script.owner_name(), &script.is_running().to_string()));
            }
        }
        tracing::debug!("{}", lines.join("\n"));
        lines
    }

    fn stats(&self) -> Vec<String> {
        let counters = self.counters();
        let lines = vec![
            format!("{} stats for {} scripts:", self.region.region_name(), self.registry.len()),
            format!("Worlds    - Total: {:>10} - Current {}", counters.worlds_total, counters.worlds_current),
            format!("Objects   - Total: {:>10} - Current {}", counters.objects_total, counters.objects_current),
            format!(
                "Listeners - Touch: {:>10} - Chat {} - New user {}",
                counters.touch_listeners, counters.chat_listeners, counters.new_user_listeners
            ),
        ];
        tracing::info!("{}", lines.join("\n"));
        lines
    }

    fn report_warn(&self, line: &str) -> Vec<String> {
        tracing::warn!("{line}");
        vec![line.to_string()]
    }

    /// Errors of a script that is not running. Running or unknown scripts report none.
    pub fn script_errors(&self, item: Uuid) -> Vec<String> {
        match self.registry.get(item) {
            Some(script) if !script.is_running() => script.errors(),
            _ => Vec::new(),
        }
    }

    /// Accumulated run time keyed by host object local id.
    pub fn execution_times(&self) -> HashMap<u32, Duration> {
        let mut times = HashMap::new();
        for (_, script) in self.registry.snapshot() {
            if let Some(local_id) = script.local_id() {
                *times.entry(local_id).or_insert(Duration::ZERO) += script.elapsed();
            }
        }
        times
    }

    /// Blocks until queued lifecycle work and fault handling have finished or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.workers.wait_idle(timeout) {
            return false;
        }
        loop {
            let faulting = self.registry.snapshot().iter().any(|(_, script)| script.is_faulting());
            if !faulting {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Starts a script directly on the calling thread.
    pub fn start_now(&self, item: Uuid, requester: Option<PrincipalId>) -> Result<(), ScriptError> {
        let script = self.registry.get(item).ok_or_else(|| ScriptError::NotConfigured(item.to_string()))?;
        let _guard = self.start_lock.lock();
        script.start(requester)
    }

    /// Disposes every script and stops listening to the region.
    pub fn close(&self) {
        if let Some(id) = self.chat_listener.lock().take() {
            self.region.unsubscribe_chat(id);
        }
        self.workers.wait_idle(self.config.stop_timeout());
        self.workers.shutdown();
        for (_, script) in self.registry.snapshot() {
            self.dispose_quietly(&script);
        }
        tracing::info!("[MRM]: Closed region '{}'.", self.region.region_name());
    }
}
