use std::sync::Arc;

use super::CapabilityContext;
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::policy::Grants;

/// String key/value storage private to one script.
#[derive(Clone)]
pub struct PersistenceCapability {
    inner: Arc<PersistenceInner>,
}

struct PersistenceInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
}

impl PersistenceCapability {
    pub(crate) fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("persistence");
        Self { inner: Arc::new(PersistenceInner { ctx, handle }) }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::PERSISTENCE)?;
        Ok(self.inner.ctx.region.persistence().get(self.inner.ctx.script_id, key))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::PERSISTENCE)?;
        self.inner.ctx.region.persistence().put(self.inner.ctx.script_id, key, value);
        Ok(())
    }
}
