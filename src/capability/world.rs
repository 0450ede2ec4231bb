use std::sync::{Arc, Weak};

use rhai::{Dynamic, Map};

use super::dispatch::HandlerCall;
use super::heightmap::HeightmapCapability;
use super::object::{avatar_map, ObjectsCapability};
use super::subscription::HandlerSet;
use super::{CapabilityContext, Counter};
use crate::error::CapabilityError;
use crate::lease::BoundedHandle;
use crate::region::{AvatarInfo, ChatMessage, NewUserEvent, ParcelInfo};

#[derive(Clone)]
pub struct WorldCapability {
    inner: Arc<WorldInner>,
}

struct WorldInner {
    ctx: CapabilityContext,
    handle: BoundedHandle,
    objects: ObjectsCapability,
    terrain: HeightmapCapability,
    chat: HandlerSet,
    new_user: HandlerSet,
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        self.ctx.counters.released(Counter::World);
    }
}

impl WorldCapability {
    pub fn new(ctx: CapabilityContext) -> Self {
        let handle = ctx.leases.issue("world");
        ctx.counters.created(Counter::World);
        let objects = ObjectsCapability::new(ctx.clone());
        let terrain = HeightmapCapability::new(ctx.clone());
        Self {
            inner: Arc::new(WorldInner {
                ctx,
                handle,
                objects,
                terrain,
                chat: HandlerSet::new(),
                new_user: HandlerSet::new(),
            }),
        }
    }

    pub fn handle(&self) -> &BoundedHandle {
        &self.inner.handle
    }

    pub fn context(&self) -> &CapabilityContext {
        &self.inner.ctx
    }

    pub fn region_name(&self) -> Result<String, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.region_name())
    }

    pub fn objects(&self) -> Result<ObjectsCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.objects.clone())
    }

    pub fn terrain(&self) -> Result<HeightmapCapability, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.terrain.clone())
    }

    pub fn avatars(&self) -> Result<Vec<AvatarInfo>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.avatars())
    }

    pub fn parcels(&self) -> Result<Vec<ParcelInfo>, CapabilityError> {
        self.inner.handle.ensure_live()?;
        Ok(self.inner.ctx.region.parcels())
    }

    pub fn on_chat(&self, handler: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        let weak = Arc::downgrade(&self.inner);
        let region = &self.inner.ctx.region;
        let attached = self
            .inner
            .chat
            .add(handler, || region.subscribe_chat(Arc::new(move |chat: &ChatMessage| deliver_chat(&weak, chat))));
        if attached {
            self.inner.ctx.counters.created(Counter::Chat);
        }
        Ok(())
    }

    pub fn remove_chat(&self, handler: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        let region = &self.inner.ctx.region;
        if self.inner.chat.remove(handler, |id| region.unsubscribe_chat(id)) {
            self.inner.ctx.counters.released(Counter::Chat);
        }
        Ok(())
    }

    pub fn on_new_user(&self, handler: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        let weak = Arc::downgrade(&self.inner);
        let region = &self.inner.ctx.region;
        let attached = self.inner.new_user.add(handler, || {
            region.subscribe_new_user(Arc::new(move |event: &NewUserEvent| deliver_new_user(&weak, event)))
        });
        if attached {
            self.inner.ctx.counters.created(Counter::NewUser);
        }
        Ok(())
    }

    pub fn remove_new_user(&self, handler: &str) -> Result<(), CapabilityError> {
        self.inner.handle.ensure_live()?;
        let region = &self.inner.ctx.region;
        if self.inner.new_user.remove(handler, |id| region.unsubscribe_new_user(id)) {
            self.inner.ctx.counters.released(Counter::NewUser);
        }
        Ok(())
    }

    pub fn chat_attached(&self) -> bool {
        self.inner.chat.is_attached()
    }

    pub fn new_user_attached(&self) -> bool {
        self.inner.new_user.is_attached()
    }

    /// Detaches every real listener the run attached and drops cached proxies.
    pub fn shutdown(&self) {
        let region = &self.inner.ctx.region;
        if self.inner.chat.clear(|id| region.unsubscribe_chat(id)) {
            self.inner.ctx.counters.released(Counter::Chat);
        }
        if self.inner.new_user.clear(|id| region.unsubscribe_new_user(id)) {
            self.inner.ctx.counters.released(Counter::NewUser);
        }
        self.inner.objects.shutdown();
    }
}

fn deliver_chat(weak: &Weak<WorldInner>, chat: &ChatMessage) {
    let Some(inner) = weak.upgrade() else { return };
    if !inner.handle.is_live() {
        return;
    }
    let mut payload = Map::new();
    payload.insert("sender".into(), Dynamic::from(chat.sender.to_string()));
    payload.insert("sender_name".into(), Dynamic::from(chat.sender_name.clone()));
    payload.insert("message".into(), Dynamic::from(chat.message.clone()));
    payload.insert("channel".into(), Dynamic::from(chat.channel));
    payload.insert("from_object".into(), Dynamic::from(chat.from_object));
    let payload = Dynamic::from_map(payload);
    for handler in inner.chat.handlers() {
        inner.ctx.dispatcher.submit(HandlerCall::new("chat", handler, vec![payload.clone()]));
    }
}

fn deliver_new_user(weak: &Weak<WorldInner>, event: &NewUserEvent) {
    let Some(inner) = weak.upgrade() else { return };
    if !inner.handle.is_live() {
        return;
    }
    let mut payload = Map::new();
    payload.insert("avatar".into(), Dynamic::from_map(avatar_map(&event.avatar)));
    let payload = Dynamic::from_map(payload);
    for handler in inner.new_user.handlers() {
        inner.ctx.dispatcher.submit(HandlerCall::new("new_user", handler, vec![payload.clone()]));
    }
}
