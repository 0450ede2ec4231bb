use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rhai::Engine;

use super::{LiveModule, StartRequest};
use crate::error::ScriptError;
use crate::lease::{BoundedHandle, LeaseScope};

/// The supervisor living inside an isolation boundary. It owns the module's start and stop
/// calls and reports uncaught failures back out through the [`Unloader`](super::Unloader).
pub struct Root {
    handle: BoundedHandle,
    /// How long handles keep answering after a clean stop.
    grace: Duration,
    engine: Arc<Engine>,
    live: Mutex<Option<LiveModule>>,
}

impl Root {
    pub(crate) fn new(leases: &LeaseScope, engine: Engine) -> Self {
        Self {
            handle: leases.issue("root"),
            grace: leases.quantum(),
            engine: Arc::new(engine),
            live: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.live.lock().is_some()
    }

    pub fn start(&self, request: StartRequest) -> Option<String> {
        if let Err(err) = self.handle.ensure_live() {
            return Some(err.to_string());
        }
        if !request.artifact.is_on_disk() {
            return Some(ScriptError::ArtifactMissing(request.artifact.path().to_path_buf()).to_string());
        }
        match LiveModule::boot(self.engine.clone(), &request) {
            Ok(live) => {
                *self.live.lock() = Some(live);
                None
            }
            Err(text) => Some(text),
        }
    }

    /// Never waits on a module call already in progress.
    pub fn tick(&self, budget: u32) -> u32 {
        let Some(live) = self.live.try_lock() else { return 0 };
        live.as_ref().map_or(0, |live| live.tick(budget))
    }

    pub fn stop(&self) -> Option<String> {
        let live = self.live.lock().take()?;
        let outcome = live.shut_down();
        let grace = self.grace;
        live.world.handle().kill_after(grace);
        live.host.handle().kill_after(grace);
        self.handle.kill_after(grace);
        if let Some(text) = &outcome {
            tracing::warn!("[mrm] problem shutting down {}: {text}", live.module.entry_type());
        }
        outcome
    }
}
