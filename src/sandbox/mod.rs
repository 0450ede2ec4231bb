//! Where a module instance lives while it runs.
//!
//! [`LocalSandbox`] instantiates the module directly with full trust. [`IsolatedSandbox`] hosts
//! it behind an [`IsolationBoundary`]: a separately limited engine, an abort flag checked on
//! every script operation, and a lease scope whose handles all die when the boundary unloads.

pub mod isolated;
pub mod local;
pub mod root;

use std::sync::Arc;

use rhai::{Array, Dynamic, Engine};
use uuid::Uuid;

use crate::capability::{HostCapability, WorldCapability};
use crate::compile::CompiledArtifact;
use crate::lease::{BoundedHandle, LeaseScope};
use crate::policy::TrustPolicy;
use crate::runtime::ModuleInstance;

pub use isolated::{IsolatedSandbox, IsolationBoundary};
pub use local::LocalSandbox;
pub use root::Root;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Local,
    Isolated,
}

/// Lets code inside a boundary ask its owner to tear it down. Requests stop arriving once the
/// handle dies.
#[derive(Clone)]
pub struct Unloader {
    handle: BoundedHandle,
    on_request: Arc<dyn Fn(String) + Send + Sync>,
}

impl Unloader {
    pub fn new(handle: BoundedHandle, on_request: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        Self { handle, on_request }
    }

    pub fn request_unload(&self, reason: String) {
        if self.handle.ensure_live().is_ok() {
            (self.on_request)(reason);
        } else {
            tracing::debug!("[mrm] unload request after '{}' died: {reason}", self.handle.label());
        }
    }
}

pub struct StartRequest {
    pub artifact: Arc<CompiledArtifact>,
    pub world: WorldCapability,
    pub host: HostCapability,
    pub script_id: Uuid,
    pub script_name: String,
    pub unloader: Unloader,
    pub args: Vec<String>,
}

pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;
    fn name(&self) -> &str;
    /// Grants and limits for capabilities created for this sandbox.
    fn policy(&self) -> Arc<TrustPolicy>;
    /// Scope every capability handle of the run is issued from.
    fn leases(&self) -> &LeaseScope;
    /// Instantiates and starts the module. `None` on success, otherwise the failure text.
    fn start(&self, request: StartRequest) -> Option<String>;
    fn tick(&self, budget: u32) -> u32;
    /// Runs the module's `stop`. Blocks for as long as the module does.
    fn stop(&self) -> Option<String>;
    /// Forcibly releases everything the sandbox holds. Safe to call more than once.
    fn unload(&self);
    fn is_unloaded(&self) -> bool;
}

/// A started module and the capabilities handed to it.
pub(crate) struct LiveModule {
    pub(crate) module: Arc<ModuleInstance>,
    pub(crate) world: WorldCapability,
    pub(crate) host: HostCapability,
}

impl LiveModule {
    /// Instantiates the entry type, wires faults to the unloader, then runs `init` and `start`.
    pub(crate) fn boot(engine: Arc<Engine>, request: &StartRequest) -> Result<Self, String> {
        let StartRequest { artifact, world, host, script_id, script_name, unloader, args } = request;
        let module = ModuleInstance::instantiate(
            script_name,
            engine,
            artifact,
            world.context().dispatcher().clone(),
            host.scheduler().clone(),
        )?;

        let name = script_name.clone();
        let unloader = unloader.clone();
        module.set_fault_hook(Arc::new(move |text: String| {
            tracing::warn!("[mrm] unhandled failure caught within '{name}'");
            unloader.request_unload(text);
        }));

        let booted = module
            .call_if_defined(
                "init",
                vec![Dynamic::from(world.clone()), Dynamic::from(host.clone()), Dynamic::from(script_id.to_string())],
            )
            .and_then(|()| {
                let args: Array = args.iter().cloned().map(Dynamic::from).collect();
                module.call("start", vec![Dynamic::from_array(args)]).map(|_| ())
            });
        match booted {
            Ok(()) => Ok(Self { module, world: world.clone(), host: host.clone() }),
            Err(text) => {
                module.close();
                world.shutdown();
                Err(text)
            }
        }
    }

    pub(crate) fn tick(&self, budget: u32) -> u32 {
        self.module.tick(budget)
    }

    /// Calls `stop`, then detaches the module from the world whether or not that succeeded.
    pub(crate) fn shut_down(&self) -> Option<String> {
        let outcome = self.module.call_if_defined("stop", Vec::new()).err();
        self.world.shutdown();
        self.module.close();
        outcome
    }
}
