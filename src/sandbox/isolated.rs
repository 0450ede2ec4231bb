use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::root::Root;
use super::{Sandbox, SandboxKind, StartRequest};
use crate::lease::LeaseScope;
use crate::module_api::{self, EngineOptions};
use crate::policy::TrustPolicy;

/// A named execution boundary with its own trust policy and base directory. Unloading it
/// aborts any script code still running inside and kills every handle it issued.
pub struct IsolationBoundary {
    name: String,
    policy: Arc<TrustPolicy>,
    base_dir: PathBuf,
    abort: Arc<AtomicBool>,
    leases: LeaseScope,
    root: RwLock<Option<Arc<Root>>>,
}

impl IsolationBoundary {
    pub fn new(name: &str, policy: TrustPolicy, base_dir: impl Into<PathBuf>, quantum: Duration) -> Self {
        Self {
            name: name.to_string(),
            policy: Arc::new(policy),
            base_dir: base_dir.into(),
            abort: Arc::new(AtomicBool::new(false)),
            leases: LeaseScope::with_quantum(name, quantum),
            root: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &Arc<TrustPolicy> {
        &self.policy
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn leases(&self) -> &LeaseScope {
        &self.leases
    }

    pub fn is_unloaded(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// The boundary's single Root, created on first use with an engine limited by the policy.
    pub fn root(&self, request: &StartRequest) -> Option<Arc<Root>> {
        if self.is_unloaded() {
            return None;
        }
        if let Some(root) = self.root.read().as_ref() {
            return Some(root.clone());
        }
        let mut slot = self.root.write();
        let root = slot.get_or_insert_with(|| {
            let engine = module_api::build_engine(EngineOptions {
                script: &request.script_name,
                libraries: request.artifact.libraries(),
                policy: Some(self.policy.as_ref()),
                abort: Some(self.abort.clone()),
            });
            Arc::new(Root::new(&self.leases, engine))
        });
        Some(root.clone())
    }

    pub fn current_root(&self) -> Option<Arc<Root>> {
        self.root.read().clone()
    }

    pub fn unload(&self) {
        if self.abort.swap(true, Ordering::AcqRel) {
            return;
        }
        self.leases.kill_all();
        self.root.write().take();
        tracing::debug!("[mrm] unloaded boundary '{}'", self.name);
    }
}

pub struct IsolatedSandbox {
    boundary: IsolationBoundary,
}

impl IsolatedSandbox {
    pub fn new(name: &str, policy: TrustPolicy, base_dir: impl Into<PathBuf>, quantum: Duration) -> Self {
        Self { boundary: IsolationBoundary::new(name, policy, base_dir, quantum) }
    }

    pub fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }
}

impl Sandbox for IsolatedSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Isolated
    }

    fn name(&self) -> &str {
        self.boundary.name()
    }

    fn policy(&self) -> Arc<TrustPolicy> {
        self.boundary.policy().clone()
    }

    fn leases(&self) -> &LeaseScope {
        self.boundary.leases()
    }

    fn start(&self, request: StartRequest) -> Option<String> {
        let Some(root) = self.boundary.root(&request) else {
            return Some(format!("boundary '{}' has been unloaded", self.boundary.name()));
        };
        tracing::debug!("[mrm] starting {} inside '{}'", request.artifact.entry_type(), self.boundary.name());
        root.start(request)
    }

    fn tick(&self, budget: u32) -> u32 {
        self.boundary.current_root().map_or(0, |root| root.tick(budget))
    }

    fn stop(&self) -> Option<String> {
        self.boundary.current_root().and_then(|root| root.stop())
    }

    fn unload(&self) {
        self.boundary.unload();
    }

    fn is_unloaded(&self) -> bool {
        self.boundary.is_unloaded()
    }
}
