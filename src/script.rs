//! One module source item and its lifecycle.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::capability::{CapabilityContext, CapabilityCounters, EventDispatcher, HostCapability, WorldCapability};
use crate::compile::declarations::{self, SourceKind};
use crate::compile::{CompiledArtifact, Compiler};
use crate::config::EngineConfig;
use crate::error::{ConfigurationError, ScriptError};
use crate::external::{self, ExternalModule};
use crate::lease::BoundedHandle;
use crate::policy::TrustPolicy;
use crate::region::{Credential, ObjectId, PrincipalId, RegionWorld, NO_PRINCIPAL};
use crate::registry::ScriptRegistry;
use crate::sandbox::{IsolatedSandbox, LocalSandbox, Sandbox, SandboxKind, StartRequest, Unloader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    Unconfigured,
    Configured,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

impl fmt::Display for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptState::Unconfigured => "unconfigured",
            ScriptState::Configured => "configured",
            ScriptState::Running => "running",
            ScriptState::Stopping => "stopping",
            ScriptState::Stopped => "stopped",
            ScriptState::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// What a completed stop looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub elapsed: Duration,
    pub timed_out: bool,
    pub fault: Option<String>,
}

/// Everything scripts of one engine share.
pub struct ScriptServices {
    pub region: Arc<dyn RegionWorld>,
    pub compiler: Arc<Compiler>,
    pub registry: Weak<ScriptRegistry>,
    pub counters: Arc<CapabilityCounters>,
    pub config: EngineConfig,
    /// Relative external module paths resolve against this.
    pub working_dir: PathBuf,
}

struct ScriptInner {
    state: ScriptState,
    source: Option<String>,
    old_source: Option<String>,
    artifact: Option<Arc<CompiledArtifact>>,
    external: Option<ExternalModule>,
    errors: Vec<String>,
    started_at: Option<Instant>,
    elapsed: Duration,
}

struct ActiveRun {
    sandbox: Arc<dyn Sandbox>,
    world: WorldCapability,
    dispatcher: Arc<EventDispatcher>,
}

pub struct Script {
    id: Uuid,
    kind: SourceKind,
    owner: PrincipalId,
    owner_name: String,
    host_object: ObjectId,
    base_name: String,
    name: OnceLock<String>,
    services: Arc<ScriptServices>,
    handle: BoundedHandle,
    this: Weak<Script>,
    /// Held for the whole of configure, start, stop, reset and dispose.
    lifecycle: Mutex<()>,
    inner: RwLock<ScriptInner>,
    run: Mutex<Option<ActiveRun>>,
    /// Set while a fault is being turned into a stop.
    faulting: AtomicBool,
}

impl Script {
    /// Registers a script for `item_name` on `host_object` and configures it from `text`.
    pub fn create(
        services: Arc<ScriptServices>,
        id: Uuid,
        host_object: ObjectId,
        item_name: &str,
        text: &str,
    ) -> Result<Arc<Self>, ScriptError> {
        let kind = declarations::source_kind(text).ok_or(ConfigurationError::MissingMarker)?;
        let object = services
            .region
            .object(host_object)
            .ok_or_else(|| ScriptError::HostObjectMissing(item_name.to_string(), host_object))?;
        let owner = object.owner();
        let owner_name = services.region.display_name(owner);
        let base_name = format!("{owner_name}.{}.{item_name}", object.name()).replace(' ', "");

        let script = Arc::new_cyclic(|this| Self {
            id,
            kind,
            owner,
            owner_name,
            host_object,
            handle: BoundedHandle::with_quantum(format!("script {base_name}"), services.config.lease_quantum()),
            base_name,
            name: OnceLock::new(),
            services: services.clone(),
            this: this.clone(),
            lifecycle: Mutex::new(()),
            inner: RwLock::new(ScriptInner {
                state: ScriptState::Unconfigured,
                source: None,
                old_source: None,
                artifact: None,
                external: None,
                errors: Vec::new(),
                started_at: None,
                elapsed: Duration::ZERO,
            }),
            run: Mutex::new(None),
            faulting: AtomicBool::new(false),
        });
        let name = match services.registry.upgrade() {
            Some(registry) => registry.add(id, &script.base_name, script.clone()),
            None => script.base_name.clone(),
        };
        let _ = script.name.set(name);
        script.set_source(text);
        Ok(script)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.name.get().map_or(&self.base_name, String::as_str)
    }

    pub fn owner(&self) -> PrincipalId {
        self.owner
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub fn host_object(&self) -> ObjectId {
        self.host_object
    }

    pub fn local_id(&self) -> Option<u32> {
        self.services.region.object(self.host_object).map(|object| object.local_id())
    }

    pub fn state(&self) -> ScriptState {
        self.inner.read().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ScriptState::Running
    }

    pub fn is_configured(&self) -> bool {
        self.inner.read().artifact.is_some()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.read().errors.clone()
    }

    pub fn source(&self) -> Option<String> {
        self.inner.read().source.clone()
    }

    pub fn previous_source(&self) -> Option<String> {
        self.inner.read().old_source.clone()
    }

    pub fn artifact(&self) -> Option<Arc<CompiledArtifact>> {
        self.inner.read().artifact.clone()
    }

    pub fn sandbox_kind(&self) -> Option<SandboxKind> {
        self.run.lock().as_ref().map(|run| run.sandbox.kind())
    }

    /// Accumulated run time, including the current run.
    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.read();
        inner.elapsed + inner.started_at.map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// True while an uncaught failure is still being handled.
    pub fn is_faulting(&self) -> bool {
        self.faulting.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.handle
    }

    /// The world wrapper handed to the current run.
    pub fn world(&self) -> Option<WorldCapability> {
        self.run.lock().as_ref().map(|run| run.world.clone())
    }

    /// Every handle the current run has issued so far.
    pub fn run_handles(&self) -> Vec<BoundedHandle> {
        self.run.lock().as_ref().map_or_else(Vec::new, |run| run.sandbox.leases().handles())
    }

    fn label(&self) -> &'static str {
        self.kind.label()
    }

    /// Replaces the source and recompiles. Returns whether the script is now configured.
    pub fn set_source(&self, text: &str) -> bool {
        let _lifecycle = self.lifecycle.lock();
        self.configure(text)
    }

    fn configure(&self, text: &str) -> bool {
        let (old_source, old_artifact) = {
            let mut inner = self.inner.write();
            if inner.state == ScriptState::Disposed {
                return false;
            }
            if inner.source.as_deref() == Some(text) {
                return inner.artifact.is_some();
            }
            inner.errors.clear();
            inner.old_source = inner.source.replace(text.to_string());
            (inner.old_source.clone(), inner.artifact.take())
        };
        self.release_artifact(old_source.as_deref(), old_artifact);

        let outcome = self.compile(text);
        let mut inner = self.inner.write();
        let settled = !matches!(inner.state, ScriptState::Running | ScriptState::Stopping);
        match outcome {
            Ok((artifact, external)) => {
                inner.artifact = Some(artifact);
                inner.external = external;
                if settled {
                    inner.state = ScriptState::Configured;
                }
                drop(inner);
                tracing::warn!("[{}] Configured {} {}.", self.label(), self.label(), self.name());
                true
            }
            Err(err) => {
                inner.errors = err.to_string().lines().map(str::to_string).collect();
                inner.external = None;
                if settled {
                    inner.state = ScriptState::Unconfigured;
                }
                let first = inner.errors.first().cloned().unwrap_or_default();
                let all = inner.errors.join("\n");
                drop(inner);
                if self.services.config.error_to_console {
                    tracing::warn!("[{}] Unable to configure {}.", self.label(), self.name());
                    tracing::debug!("{all}");
                } else {
                    tracing::warn!("[{}] Unable to configure {}.\n{first}", self.label(), self.name());
                }
                false
            }
        }
    }

    fn compile(&self, text: &str) -> Result<(Arc<CompiledArtifact>, Option<ExternalModule>), ScriptError> {
        let compiler = &self.services.compiler;
        match self.kind {
            SourceKind::Inline => Ok((compiler.compile(self.id, self.name(), text)?, None)),
            SourceKind::External => {
                let module = external::resolve(text, &self.services.working_dir)?;
                let artifact = compiler.compile_private(
                    self.id,
                    self.name(),
                    &module.source,
                    &compiler.region_dir(),
                    &module.entry_type,
                )?;
                Ok((Arc::new(artifact), Some(module)))
            }
        }
    }

    fn release_artifact(&self, source: Option<&str>, artifact: Option<Arc<CompiledArtifact>>) {
        match self.kind {
            SourceKind::Inline => {
                if let Some(source) = source {
                    self.services.compiler.release(source, self.id);
                }
            }
            SourceKind::External => {
                if let Some(artifact) = artifact {
                    artifact.remove_files();
                }
            }
        }
    }

    /// Requester `None` is the host itself and skips authorization.
    pub fn start(&self, requester: Option<PrincipalId>) -> Result<(), ScriptError> {
        if let Some(requester) = requester {
            self.authorize("start", requester)?;
        }
        let _lifecycle = self.lifecycle.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> Result<(), ScriptError> {
        let (artifact, external) = {
            let mut inner = self.inner.write();
            match inner.state {
                ScriptState::Disposed => return Err(ScriptError::Disposed(self.name().to_string())),
                ScriptState::Running | ScriptState::Stopping => {
                    inner.errors.clear();
                    drop(inner);
                    self.notify_problem(&format!("Unable to start {}, it is already Running.", self.name()));
                    return Err(ScriptError::AlreadyRunning(self.name().to_string()));
                }
                _ => {}
            }
            let Some(artifact) = inner.artifact.clone() else {
                return Err(ScriptError::NotConfigured(self.name().to_string()));
            };
            inner.errors.clear();
            (artifact, inner.external.clone())
        };
        tracing::info!("[{}]: Starting {}.", self.label(), self.name());

        let config = &self.services.config;
        let sandbox: Arc<dyn Sandbox> = match (&external, config.sandboxed) {
            (Some(module), _) => Arc::new(IsolatedSandbox::new(
                self.name(),
                TrustPolicy::named(&config.external_sandbox_policy),
                module.base_folder.clone(),
                config.lease_quantum(),
            )),
            (None, true) => Arc::new(IsolatedSandbox::new(
                self.name(),
                TrustPolicy::named(&config.sandbox_policy),
                self.services.compiler.region_dir(),
                config.lease_quantum(),
            )),
            (None, false) => Arc::new(LocalSandbox::new(self.name(), config.lease_quantum())),
        };
        let god = match &external {
            Some(module) => config.external_god_scripts || module.god,
            None => config.god_scripts,
        };
        let dispatcher = EventDispatcher::new(self.name(), config.event_dispatch);
        let ctx = CapabilityContext::new(
            self.services.region.clone(),
            Credential::new(self.owner, god),
            sandbox.policy(),
            sandbox.leases().clone(),
            dispatcher.clone(),
            self.services.counters.clone(),
            self.id,
            self.name(),
        );
        let world = WorldCapability::new(ctx);
        let host = match HostCapability::new(&world, self.host_object) {
            Ok(host) => host,
            Err(err) => {
                world.shutdown();
                sandbox.unload();
                let failure = ScriptError::HostObjectMissing(self.name().to_string(), self.host_object);
                self.inner.write().errors = vec![failure.to_string(), err.to_string()];
                self.notify_problem(&format!("Unable to start {}.", self.name()));
                return Err(failure);
            }
        };

        let this = self.this.clone();
        let unloader = Unloader::new(
            sandbox.leases().issue("unloader"),
            Arc::new(move |reason: String| {
                if let Some(script) = this.upgrade() {
                    script.handle_fault(reason);
                }
            }),
        );
        let request = StartRequest {
            artifact,
            world: world.clone(),
            host,
            script_id: self.id,
            script_name: self.name().to_string(),
            unloader,
            args: external.map(|module| module.args).unwrap_or_default(),
        };

        match sandbox.start(request) {
            None => {
                *self.run.lock() = Some(ActiveRun { sandbox, world, dispatcher });
                let mut inner = self.inner.write();
                inner.state = ScriptState::Running;
                inner.started_at = Some(Instant::now());
                drop(inner);
                tracing::warn!("[{}]: {} started.", self.label(), self.name());
                Ok(())
            }
            Some(text) => {
                world.shutdown();
                dispatcher.close();
                sandbox.unload();
                self.inner.write().errors = text.lines().map(str::to_string).collect();
                self.notify_problem(&format!("Unable to start {}.", self.name()));
                Err(ScriptError::RuntimeFault { script: self.name().to_string(), detail: text })
            }
        }
    }

    /// Runs microthreads. Does nothing unless running, and never waits for a lifecycle call.
    pub fn tick(&self, budget: u32) -> u32 {
        if self.inner.try_read().map(|inner| inner.state) != Some(ScriptState::Running) {
            return 0;
        }
        let sandbox = match self.run.try_lock() {
            Some(run) => run.as_ref().map(|run| run.sandbox.clone()),
            None => None,
        };
        sandbox.map_or(0, |sandbox| sandbox.tick(budget))
    }

    /// Renews the script's own handle and the leases of its current run. Returns how many run
    /// handles were reclaimed.
    pub fn sweep_leases(&self) -> usize {
        if self.state() != ScriptState::Disposed {
            self.handle.renew();
        }
        let Some(run) = self.run.try_lock() else { return 0 };
        match run.as_ref() {
            Some(active) => active.sandbox.leases().sweep().reclaimed,
            None => 0,
        }
    }

    pub fn stop(&self, requester: Option<PrincipalId>) -> Result<StopReport, ScriptError> {
        if let Some(requester) = requester {
            self.authorize("stop", requester)?;
        }
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<StopReport, ScriptError> {
        {
            let mut inner = self.inner.write();
            match inner.state {
                ScriptState::Running => inner.state = ScriptState::Stopping,
                ScriptState::Disposed => return Err(ScriptError::Disposed(self.name().to_string())),
                _ => {
                    drop(inner);
                    tracing::warn!("[{}]: Unable to stop {}. It is not running.", self.label(), self.name());
                    return Err(ScriptError::NotRunning(self.name().to_string()));
                }
            }
        }
        tracing::info!("[{}]: Stopping {}.", self.label(), self.name());

        let run = self.run.lock().take();
        let timeout = self.services.config.stop_timeout();
        let (timed_out, fault) = match &run {
            Some(run) => self.run_stop_thread(run.sandbox.clone(), timeout),
            None => (false, None),
        };
        if let Some(run) = &run {
            run.world.shutdown();
            run.dispatcher.close();
            run.sandbox.unload();
        }

        let mut inner = self.inner.write();
        let elapsed = inner.started_at.take().map_or(Duration::ZERO, |started| started.elapsed());
        inner.elapsed += elapsed;
        inner.state = ScriptState::Stopped;
        if timed_out {
            inner.errors.push(ScriptError::TimeoutOnStop { script: self.name().to_string(), timeout }.to_string());
        }
        drop(inner);

        if timed_out {
            tracing::warn!("[{}]: {} did not stop within {timeout:?}, unloaded anyway.", self.label(), self.name());
        }
        if let Some(fault) = &fault {
            tracing::warn!("[{}]: Problem stopping {}. {fault}", self.label(), self.name());
        }
        tracing::warn!("[{}]: {} stopped.", self.label(), self.name());
        Ok(StopReport { elapsed, timed_out, fault })
    }

    fn run_stop_thread(&self, sandbox: Arc<dyn Sandbox>, timeout: Duration) -> (bool, Option<String>) {
        let (sender, receiver) = bounded::<Option<String>>(1);
        let spawned = thread::Builder::new().name(format!("{} stop thread", self.name())).spawn(move || {
            let _ = sender.send(sandbox.stop());
        });
        if let Err(err) = spawned {
            return (false, Some(format!("unable to spawn stop thread: {err}")));
        }
        match receiver.recv_timeout(timeout) {
            Ok(fault) => (false, fault),
            Err(RecvTimeoutError::Timeout) => (true, None),
            Err(RecvTimeoutError::Disconnected) => (false, Some("stop thread ended without reporting".to_string())),
        }
    }

    /// Stops if running, then starts again provided the host object still exists.
    pub fn reset(&self, requester: Option<PrincipalId>) -> Result<(), ScriptError> {
        if let Some(requester) = requester {
            self.authorize("restart", requester)?;
        }
        let _lifecycle = self.lifecycle.lock();
        if self.state() == ScriptState::Running {
            self.stop_locked()?;
        }
        let host_exists = self.services.region.object(self.host_object).is_some_and(|object| object.exists());
        if !host_exists {
            return Err(ScriptError::HostObjectMissing(self.name().to_string(), self.host_object));
        }
        self.start_locked()
    }

    /// Tears the script down for good. Returns `false` when it was already disposed.
    pub fn dispose(&self, requester: Option<PrincipalId>) -> Result<bool, ScriptError> {
        if let Some(requester) = requester {
            self.authorize("dispose", requester)?;
        }
        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            ScriptState::Disposed => return Ok(false),
            ScriptState::Running => {
                self.stop_locked()?;
            }
            _ => {}
        }
        let (source, artifact) = {
            let mut inner = self.inner.write();
            inner.state = ScriptState::Disposed;
            inner.external = None;
            (inner.source.clone(), inner.artifact.take())
        };
        self.release_artifact(source.as_deref(), artifact);
        if let Some(registry) = self.services.registry.upgrade() {
            registry.remove(self.id);
        }
        self.handle.kill();
        tracing::info!("[{}]: Disposed {}.", self.label(), self.name());
        Ok(true)
    }

    /// Only the owner and the host may drive a script.
    pub fn authorize(&self, command: &str, requester: PrincipalId) -> Result<(), ScriptError> {
        if requester == self.owner || requester == NO_PRINCIPAL {
            return Ok(());
        }
        let actor = self.services.region.display_name(requester);
        tracing::warn!("Can't execute {command} on {}. {actor} is not authorized.", self.name());
        Err(ScriptError::Unauthorized { command: command.to_string(), script: self.name().to_string(), actor })
    }

    /// Tells the owner (when online) and the operator log about a problem and the error log.
    pub fn notify_problem(&self, problem: &str) {
        let errors = self.errors();
        let detail = errors.join("\n");
        let region = &self.services.region;
        if region.is_online(self.owner) {
            region.alert(self.owner, problem);
            for line in &errors {
                region.alert(self.owner, line);
            }
            if self.services.config.error_to_console {
                tracing::warn!("[{}]: {problem}", self.label());
                if !detail.trim().is_empty() {
                    tracing::debug!("{detail}");
                }
            } else {
                tracing::warn!("[{}]: {problem} {}", self.label(), errors.first().map_or("", String::as_str));
            }
        } else {
            tracing::warn!("[{}]: {problem}", self.label());
            if !detail.trim().is_empty() {
                tracing::debug!("{detail}");
            }
        }
    }

    /// An uncaught failure inside the module: record it, tell the owner, stop on a fresh thread.
    fn handle_fault(&self, reason: String) {
        if self.state() == ScriptState::Disposed || self.faulting.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(script) = self.this.upgrade() else {
            self.faulting.store(false, Ordering::Release);
            return;
        };
        let spawned = thread::Builder::new().name(format!("{} fault", self.name())).spawn(move || {
            script.inner.write().errors = reason.lines().map(str::to_string).collect();
            script.notify_problem(&format!("Problem while running {}.", script.name()));
            if let Err(err) = script.stop(None) {
                tracing::debug!("[{}]: {err}", script.label());
            }
            script.faulting.store(false, Ordering::Release);
        });
        if let Err(err) = spawned {
            self.faulting.store(false, Ordering::Release);
            tracing::error!("[{}]: unable to spawn fault handler for {}: {err}", self.label(), self.name());
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
