use std::sync::Arc;

use super::graphics::GraphicsCapability;
use super::object::ObjectCapability;
use super::persistence::PersistenceCapability;
use super::scheduler::SchedulerCapability;
use super::world::WorldCapability;
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::region::ObjectId;

/// The module's view of the object hosting it, plus its private facilities.
#[derive(Clone)]
pub struct HostCapability {
    inner: Arc<HostInner>,
}

struct HostInner {
    script_name: Arc<str>,
    handle: BoundedHandle,
    object: ObjectCapability,
    scheduler: SchedulerCapability,
    persistence: PersistenceCapability,
    graphics: GraphicsCapability,
}

impl HostCapability {
    /// The host object proxy comes from the world's accessor so both views share one instance.
    pub fn new(world: &WorldCapability, host_object: ObjectId) -> Result<Self, CapabilityError> {
        let ctx = world.context().clone();
        let object = world.objects()?.get(host_object)?.ok_or(CapabilityError::ObjectMissing(host_object))?;
        Ok(Self {
            inner: Arc::new(HostInner {
                script_name: ctx.script_name.clone(),
                handle: ctx.leases.issue("host"),
                object,
                scheduler: SchedulerCapability::new(ctx.clone()),
                persistence: PersistenceCapability::new(ctx.clone()),
                graphics: GraphicsCapability::new(ctx),
            }),
        })
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.inner.handle
    }

    pub fn object(&self) -> Result<ObjectCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.object.clone())
    }

    pub fn microthreads(&self) -> Result<SchedulerCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.scheduler.clone())
    }

    pub fn persistence(&self) -> Result<PersistenceCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.persistence.clone())
    }

    pub fn graphics(&self) -> Result<GraphicsCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.graphics.clone())
    }

    pub fn log(&self, message: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        tracing::info!("[mrm:{}] {message}", self.inner.script_name);
        Ok(())
    }

    /// Scheduler access for the runtime, which must keep working while the host handle is
    /// already in its grace period.
    pub(crate) fn scheduler(&self) -> &SchedulerCapability {
        &self.inner.scheduler
    }
}
