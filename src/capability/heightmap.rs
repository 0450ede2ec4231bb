use std::sync::Arc;

use super::CapabilityContext;
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::policy::Grants;

#[derive(Clone)]
pub struct HeightmapCapability {
    inner: Arc<HeightmapInner>,
}

struct HeightmapInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
}

impl HeightmapCapability {
    pub(crate) fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("heightmap");
        Self { inner: Arc::new(HeightmapInner { ctx, handle }) }
    }

    pub fn width(&self) -> Result<i64, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.terrain().width())
    }

    pub fn length(&self) -> Result<i64, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.terrain().length())
    }

    pub fn get(&self, x: i64, y: i64) -> Result<f64, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.terrain().get(x, y)?)
    }

    /// Terrain belongs to the region owner; only they (or a god) may reshape it.
    pub fn set(&self, x: i64, y: i64, height: f64) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::TERRAIN)?;
        let region = &self.inner.ctx.region;
        self.inner.ctx.require_edit(region.region_owner(), format_args!("terrain of {}", region.region_name()))?;
        Ok(region.terrain().set(x, y, height)?)
    }
}
