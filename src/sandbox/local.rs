use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{LiveModule, Sandbox, SandboxKind, StartRequest};
use crate::lease::LeaseScope;
use crate::module_api::{self, EngineOptions};
use crate::policy::TrustPolicy;

/// Runs the module directly in the host with full trust. A module stuck in `stop` cannot be
/// interrupted here; unloading only cuts it off from the world.
pub struct LocalSandbox {
    name: String,
    policy: Arc<TrustPolicy>,
    leases: LeaseScope,
    live: Mutex<Option<LiveModule>>,
    unloaded: AtomicBool,
}

impl LocalSandbox {
    pub fn new(name: &str, quantum: Duration) -> Self {
        Self {
            name: name.to_string(),
            policy: Arc::new(TrustPolicy::full_trust()),
            leases: LeaseScope::with_quantum(name, quantum),
            live: Mutex::new(None),
            unloaded: AtomicBool::new(false),
        }
    }
}

impl Sandbox for LocalSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> Arc<TrustPolicy> {
        self.policy.clone()
    }

    fn leases(&self) -> &LeaseScope {
        &self.leases
    }

    fn start(&self, request: StartRequest) -> Option<String> {
        if self.is_unloaded() {
            return Some(format!("sandbox '{}' has been unloaded", self.name));
        }
        let engine = module_api::build_engine(EngineOptions {
            script: &request.script_name,
            libraries: request.artifact.libraries(),
            policy: None,
            abort: None,
        });
        match LiveModule::boot(Arc::new(engine), &request) {
            Ok(live) => {
                *self.live.lock() = Some(live);
                None
            }
            Err(text) => Some(text),
        }
    }

    fn tick(&self, budget: u32) -> u32 {
        let Some(live) = self.live.try_lock() else { return 0 };
        live.as_ref().map_or(0, |live| live.tick(budget))
    }

    fn stop(&self) -> Option<String> {
        let live = self.live.lock().take()?;
        live.shut_down()
    }

    fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        self.leases.kill_all();
        if let Some(live) = self.live.lock().take() {
            live.world.shutdown();
            live.module.close();
        }
    }

    fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }
}
