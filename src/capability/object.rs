use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rhai::{Dynamic, Map};
use uuid::Uuid;

use super::dispatch::HandlerCall;
use super::subscription::HandlerSet;
use super::{CapabilityContext, Counter};
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::policy::Grants;
use crate::region::{AvatarInfo, ObjectId, PrincipalId, SceneObject, TouchEvent, Vector3};

/// A scene object as seen by one script run.
#[derive(Clone)]
pub struct ObjectCapability {
    inner: Arc<ObjectInner>,
}

struct ObjectInner {
    id: ObjectId,
    ctx: CapabilityContext,
    handle: BoundedHandle,
    touch: HandlerSet,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        self.ctx.counters.released(Counter::Object);
    }
}

impl ObjectCapability {
    fn new(id: ObjectId, ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue(&format!("object:{id}"));
        ctx.counters.created(Counter::Object);
        Self { inner: Arc::new(ObjectInner { id, ctx, handle, touch: HandlerSet::new() }) }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.inner.handle
    }

    /// True when both values are the same proxy instance.
    pub fn same_proxy(&self, other: &ObjectCapability) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn target(&self) -> Result<Arc<dyn SceneObject>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.region.object(self.inner.id).ok_or(CapabilityError::ObjectMissing(self.inner.id))
    }

    fn editable(&self) -> Result<Arc<dyn SceneObject>, CapabilityError> {
        let target = self.target()?;
        self.inner.ctx.require_edit(target.owner(), format_args!("object with id [{}]", self.inner.id))?;
        Ok(target)
    }

    pub fn exists(&self) -> bool {
        self.target().map(|object| object.exists()).unwrap_or(false)
    }

    pub fn local_id(&self) -> Result<u32, CapabilityError> {
        Ok(self.target()?.local_id())
    }

    pub fn owner(&self) -> Result<PrincipalId, CapabilityError> {
        Ok(self.target()?.owner())
    }

    pub fn name(&self) -> Result<String, CapabilityError> {
        Ok(self.target()?.name())
    }

    pub fn set_name(&self, name: &str) -> Result<(), CapabilityError> {
        self.editable()?.set_name(name);
        Ok(())
    }

    pub fn description(&self) -> Result<String, CapabilityError> {
        Ok(self.target()?.description())
    }

    pub fn set_description(&self, description: &str) -> Result<(), CapabilityError> {
        self.editable()?.set_description(description);
        Ok(())
    }

    pub fn text(&self) -> Result<String, CapabilityError> {
        Ok(self.target()?.text())
    }

    pub fn set_text(&self, text: &str) -> Result<(), CapabilityError> {
        self.editable()?.set_text(text);
        Ok(())
    }

    pub fn position(&self) -> Result<Vector3, CapabilityError> {
        Ok(self.target()?.position())
    }

    pub fn set_position(&self, position: Vector3) -> Result<(), CapabilityError> {
        self.editable()?.set_position(position);
        Ok(())
    }

    pub fn say(&self, message: &str, channel: i64) -> Result<(), CapabilityError> {
        self.inner.ctx.require(Grants::CHAT)?;
        self.editable()?.say(message, channel);
        Ok(())
    }

    pub fn on_touch(&self, handler: &str) -> Result<(), CapabilityError> {
        let target = self.target()?;
        let weak = Arc::downgrade(&self.inner);
        let attached = self.inner.touch.add(handler, || {
            target.subscribe_touch(Arc::new(move |event: &TouchEvent| deliver_touch(&weak, event)))
        });
        if attached {
            self.inner.ctx.counters.created(Counter::Touch);
        }
        Ok(())
    }

    pub fn remove_touch(&self, handler: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.detach_touch(Some(handler));
        Ok(())
    }

    pub fn touch_handlers(&self) -> usize {
        self.inner.touch.len()
    }

    pub fn touch_attached(&self) -> bool {
        self.inner.touch.is_attached()
    }

    fn detach_touch(&self, handler: Option<&str>) {
        let region = &self.inner.ctx.region;
        let id = self.inner.id;
        let detach = |listener| {
            if let Some(object) = region.object(id) {
                object.unsubscribe_touch(listener);
            }
        };
        let detached = match handler {
            Some(handler) => self.inner.touch.remove(handler, detach),
            None => self.inner.touch.clear(detach),
        };
        if detached {
            self.inner.ctx.counters.released(Counter::Touch);
        }
    }
}

fn deliver_touch(weak: &Weak<ObjectInner>, event: &TouchEvent) {
    let Some(inner) = weak.upgrade() else { return };
    if !inner.handle.is_live() {
        return;
    }
    let proxy = ObjectCapability { inner: inner.clone() };
    let mut payload = Map::new();
    payload.insert("object".into(), Dynamic::from(proxy));
    payload.insert("avatar".into(), Dynamic::from_map(avatar_map(&event.avatar)));
    let payload = Dynamic::from_map(payload);
    for handler in inner.touch.handlers() {
        inner.ctx.dispatcher.submit(HandlerCall::new("touch", handler, vec![payload.clone()]));
    }
}

pub(crate) fn avatar_map(avatar: &AvatarInfo) -> Map {
    let mut map = Map::new();
    map.insert("id".into(), Dynamic::from(avatar.id.to_string()));
    map.insert("name".into(), Dynamic::from(avatar.name.clone()));
    map.insert("position".into(), Dynamic::from(avatar.position));
    map
}

/// Object accessor with an identity-stable proxy cache keyed by object id.
#[derive(Clone)]
pub struct ObjectsCapability {
    inner: Arc<ObjectsInner>,
}

struct ObjectsInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
    cache: Mutex<HashMap<ObjectId, ObjectCapability>>,
}

impl ObjectsCapability {
    pub(crate) fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("objects");
        Self { inner: Arc::new(ObjectsInner { ctx, handle, cache: Mutex::new(HashMap::new()) }) }
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.inner.handle
    }

    fn proxy(&self, id: ObjectId) -> ObjectCapability {
        self.inner
            .cache
            .lock()
            .entry(id)
            .or_insert_with(|| ObjectCapability::new(id, self.inner.ctx.clone()))
            .clone()
    }

    pub fn get(&self, id: ObjectId) -> Result<Option<ObjectCapability>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.object(id).map(|object| self.proxy(object.id())))
    }

    pub fn by_local_id(&self, local_id: u32) -> Result<Option<ObjectCapability>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.object_by_local_id(local_id).map(|object| self.proxy(object.id())))
    }

    pub fn find(&self, name: &str) -> Result<Vec<ObjectCapability>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self
            .inner
            .ctx
            .region
            .objects()
            .into_iter()
            .filter(|object| object.name() == name)
            .map(|object| self.proxy(object.id()))
            .collect())
    }

    pub fn all(&self) -> Result<Vec<ObjectCapability>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.objects().into_iter().map(|object| self.proxy(object.id())).collect())
    }

    pub fn count(&self) -> Result<usize, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.objects().len())
    }

    pub fn create(&self, name: &str, position: Vector3) -> Result<ObjectCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::OBJECTS)?;
        let object = self.inner.ctx.region.create_object(self.inner.ctx.credential.principal, name, position)?;
        Ok(self.proxy(object.id()))
    }

    pub fn remove(&self, object: &ObjectCapability) -> Result<bool, CapabilityError> {
        self.inner.handle.ensure_live()?;
        self.inner.ctx.require(Grants::OBJECTS)?;
        object.editable()?;
        object.detach_touch(None);
        self.inner.cache.lock().remove(&object.id());
        Ok(self.inner.ctx.region.remove_object(object.id()))
    }

    pub fn cached(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Detaches every touch listener and empties the proxy cache.
    pub(crate) fn shutdown(&self) {
        let proxies: Vec<ObjectCapability> = self.inner.cache.lock().drain().map(|(_, proxy)| proxy).collect();
        for proxy in proxies {
            proxy.detach_touch(None);
        }
    }
}

pub(crate) fn parse_object_id(raw: &str) -> Result<Uuid, CapabilityError> {
    Uuid::parse_str(raw.trim()).map_err(|err| CapabilityError::Region(format!("'{raw}' is not an object id: {err}")))
}
