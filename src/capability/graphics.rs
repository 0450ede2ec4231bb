use std::sync::Arc;

use uuid::Uuid;

use super::CapabilityContext;
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::policy::Grants;

#[derive(Clone)]
pub struct GraphicsCapability {
    inner: Arc<GraphicsInner>,
}

struct GraphicsInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
}

impl GraphicsCapability {
    pub(crate) fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("graphics");
        Self { inner: Arc::new(GraphicsInner { ctx, handle }) }
    }

    pub fn save_bitmap(&self, bytes: &[u8], lossless: bool, temporary: bool) -> Result<Uuid, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::GRAPHICS)?;
        let owner = self.inner.ctx.credential.principal;
        Ok(self.inner.ctx.region.assets().save_bitmap(owner, bytes, lossless, temporary))
    }

    pub fn load_bitmap(&self, id: Uuid) -> Result<Vec<u8>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::GRAPHICS)?;
        Ok(self.inner.ctx.region.assets().load_bitmap(id)?)
    }
}
