//! In-memory region used by the harness and the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::WorldError;
use crate::region::{
    AssetStore, AvatarInfo, ChatListener, ChatMessage, Heightmap, ListenerId, NewUserEvent, NewUserListener,
    ObjectId, ParcelInfo, PersistenceStore, PrincipalId, RegionWorld, SceneObject, TouchEvent, TouchListener,
    Vector3,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub sender_name: String,
    pub channel: i64,
    pub message: String,
}

#[derive(Default)]
struct Listeners<L> {
    next: u64,
    entries: Vec<(ListenerId, L)>,
}

impl<L: Clone> Listeners<L> {
    fn add(&mut self, listener: L) -> ListenerId {
        self.next += 1;
        self.entries.push((self.next, listener));
        self.next
    }

    fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|(existing, _)| *existing != id);
    }

    fn snapshot(&self) -> Vec<L> {
        self.entries.iter().map(|(_, listener)| listener.clone()).collect()
    }
}

struct ObjectData {
    name: String,
    description: String,
    text: String,
    position: Vector3,
}

pub struct MemoryObject {
    id: ObjectId,
    local_id: u32,
    owner: PrincipalId,
    data: RwLock<ObjectData>,
    removed: std::sync::atomic::AtomicBool,
    touch: Mutex<Listeners<TouchListener>>,
    region: std::sync::Weak<RegionShared>,
}

impl MemoryObject {
    pub fn touch_listener_count(&self) -> usize {
        self.touch.lock().entries.len()
    }
}

impl SceneObject for MemoryObject {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn local_id(&self) -> u32 {
        self.local_id
    }

    fn owner(&self) -> PrincipalId {
        self.owner
    }

    fn exists(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
    }

    fn name(&self) -> String {
        self.data.read().name.clone()
    }

    fn set_name(&self, name: &str) {
        self.data.write().name = name.to_string();
    }

    fn description(&self) -> String {
        self.data.read().description.clone()
    }

    fn set_description(&self, description: &str) {
        self.data.write().description = description.to_string();
    }

    fn text(&self) -> String {
        self.data.read().text.clone()
    }

    fn set_text(&self, text: &str) {
        self.data.write().text = text.to_string();
    }

    fn position(&self) -> Vector3 {
        self.data.read().position
    }

    fn set_position(&self, position: Vector3) {
        self.data.write().position = position;
    }

    fn say(&self, message: &str, channel: i64) {
        if let Some(region) = self.region.upgrade() {
            let chat = ChatMessage {
                sender: self.id,
                sender_name: self.name(),
                message: message.to_string(),
                channel,
                from_object: true,
            };
            region.broadcast_chat(chat);
        }
    }

    fn subscribe_touch(&self, listener: TouchListener) -> ListenerId {
        self.touch.lock().add(listener)
    }

    fn unsubscribe_touch(&self, id: ListenerId) {
        self.touch.lock().remove(id);
    }
}

pub struct MemoryHeightmap {
    width: i64,
    length: i64,
    heights: RwLock<Vec<f64>>,
}

impl MemoryHeightmap {
    pub fn flat(width: i64, length: i64, height: f64) -> Self {
        let cells = (width.max(0) * length.max(0)) as usize;
        Self { width, length, heights: RwLock::new(vec![height; cells]) }
    }

    fn index(&self, x: i64, y: i64) -> Result<usize, WorldError> {
        if x < 0 || y < 0 || x >= self.width || y >= self.length {
            return Err(WorldError::OutOfRange { x, y });
        }
        Ok((y * self.width + x) as usize)
    }
}

impl Heightmap for MemoryHeightmap {
    fn width(&self) -> i64 {
        self.width
    }

    fn length(&self) -> i64 {
        self.length
    }

    fn get(&self, x: i64, y: i64) -> Result<f64, WorldError> {
        let index = self.index(x, y)?;
        Ok(self.heights.read()[index])
    }

    fn set(&self, x: i64, y: i64, height: f64) -> Result<(), WorldError> {
        let index = self.index(x, y)?;
        self.heights.write()[index] = height;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStores {
    values: RwLock<HashMap<(Uuid, String), String>>,
    bitmaps: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl PersistenceStore for MemoryStores {
    fn get(&self, script: Uuid, key: &str) -> Option<String> {
        self.values.read().get(&(script, key.to_string())).cloned()
    }

    fn put(&self, script: Uuid, key: &str, value: &str) {
        self.values.write().insert((script, key.to_string()), value.to_string());
    }
}

impl AssetStore for MemoryStores {
    fn save_bitmap(&self, _owner: PrincipalId, bytes: &[u8], _lossless: bool, _temporary: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.bitmaps.write().insert(id, bytes.to_vec());
        id
    }

    fn load_bitmap(&self, id: Uuid) -> Result<Vec<u8>, WorldError> {
        self.bitmaps.read().get(&id).cloned().ok_or(WorldError::AssetNotFound(id))
    }
}

struct RegionShared {
    id: Uuid,
    name: String,
    owner: PrincipalId,
    objects: RwLock<Vec<Arc<MemoryObject>>>,
    principals: RwLock<HashMap<PrincipalId, (String, bool)>>,
    avatars: RwLock<Vec<AvatarInfo>>,
    parcels: RwLock<Vec<ParcelInfo>>,
    terrain: Arc<MemoryHeightmap>,
    stores: Arc<MemoryStores>,
    chat: Mutex<Listeners<ChatListener>>,
    new_user: Mutex<Listeners<NewUserListener>>,
    transcript: Mutex<Vec<ChatRecord>>,
    alerts: Mutex<Vec<(PrincipalId, String)>>,
    next_local_id: AtomicU32,
    chat_broadcasts: AtomicU64,
}

impl RegionShared {
    fn broadcast_chat(&self, chat: ChatMessage) {
        self.transcript.lock().push(ChatRecord {
            sender_name: chat.sender_name.clone(),
            channel: chat.channel,
            message: chat.message.clone(),
        });
        self.chat_broadcasts.fetch_add(1, Ordering::Relaxed);
        let listeners = self.chat.lock().snapshot();
        for listener in listeners {
            listener(&chat);
        }
    }
}

/// A region whose state lives entirely in memory.
#[derive(Clone)]
pub struct MemoryRegion {
    shared: Arc<RegionShared>,
}

impl MemoryRegion {
    pub fn new(name: &str, owner: PrincipalId) -> Self {
        Self {
            shared: Arc::new(RegionShared {
                id: Uuid::new_v4(),
                name: name.to_string(),
                owner,
                objects: RwLock::new(Vec::new()),
                principals: RwLock::new(HashMap::new()),
                avatars: RwLock::new(Vec::new()),
                parcels: RwLock::new(Vec::new()),
                terrain: Arc::new(MemoryHeightmap::flat(16, 16, 21.0)),
                stores: Arc::new(MemoryStores::default()),
                chat: Mutex::new(Listeners { next: 0, entries: Vec::new() }),
                new_user: Mutex::new(Listeners { next: 0, entries: Vec::new() }),
                transcript: Mutex::new(Vec::new()),
                alerts: Mutex::new(Vec::new()),
                next_local_id: AtomicU32::new(1),
                chat_broadcasts: AtomicU64::new(0),
            }),
        }
    }

    pub fn add_principal(&self, id: PrincipalId, name: &str, online: bool) {
        self.shared.principals.write().insert(id, (name.to_string(), online));
    }

    pub fn add_parcel(&self, name: &str, owner: PrincipalId, area: i64) {
        self.shared.parcels.write().push(ParcelInfo { id: Uuid::new_v4(), name: name.to_string(), owner, area });
    }

    pub fn add_object(&self, id: ObjectId, owner: PrincipalId, name: &str, position: Vector3) -> Arc<MemoryObject> {
        let object = Arc::new(MemoryObject {
            id,
            local_id: self.shared.next_local_id.fetch_add(1, Ordering::Relaxed),
            owner,
            data: RwLock::new(ObjectData {
                name: name.to_string(),
                description: String::new(),
                text: String::new(),
                position,
            }),
            removed: std::sync::atomic::AtomicBool::new(false),
            touch: Mutex::new(Listeners { next: 0, entries: Vec::new() }),
            region: Arc::downgrade(&self.shared),
        });
        self.shared.objects.write().push(object.clone());
        object
    }

    pub fn memory_object(&self, id: ObjectId) -> Option<Arc<MemoryObject>> {
        self.shared.objects.read().iter().find(|object| object.id == id).cloned()
    }

    /// Brings an avatar into the region and raises the new-user event.
    pub fn arrive(&self, id: PrincipalId, name: &str, position: Vector3) {
        self.add_principal(id, name, true);
        let avatar = AvatarInfo { id, name: name.to_string(), position };
        self.shared.avatars.write().push(avatar.clone());
        let listeners = self.shared.new_user.lock().snapshot();
        let event = NewUserEvent { avatar };
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn touch(&self, object: ObjectId, avatar: PrincipalId) -> Result<(), WorldError> {
        let target = self.memory_object(object).ok_or(WorldError::ObjectNotFound(object))?;
        let avatar = self
            .shared
            .avatars
            .read()
            .iter()
            .find(|info| info.id == avatar)
            .cloned()
            .unwrap_or_else(|| AvatarInfo {
                id: avatar,
                name: self.display_name(avatar),
                position: Vector3::default(),
            });
        let listeners = target.touch.lock().snapshot();
        let event = TouchEvent { object, avatar };
        for listener in listeners {
            listener(&event);
        }
        Ok(())
    }

    pub fn chat_from(&self, sender: PrincipalId, message: &str, channel: i64) {
        let chat = ChatMessage {
            sender,
            sender_name: self.display_name(sender),
            message: message.to_string(),
            channel,
            from_object: false,
        };
        self.shared.broadcast_chat(chat);
    }

    pub fn transcript(&self) -> Vec<ChatRecord> {
        self.shared.transcript.lock().clone()
    }

    pub fn alerts(&self) -> Vec<(PrincipalId, String)> {
        self.shared.alerts.lock().clone()
    }

    pub fn chat_listener_count(&self) -> usize {
        self.shared.chat.lock().entries.len()
    }

    pub fn new_user_listener_count(&self) -> usize {
        self.shared.new_user.lock().entries.len()
    }

    pub fn stores(&self) -> Arc<MemoryStores> {
        self.shared.stores.clone()
    }
}

impl RegionWorld for MemoryRegion {
    fn region_id(&self) -> Uuid {
        self.shared.id
    }

    fn region_name(&self) -> String {
        self.shared.name.clone()
    }

    fn region_owner(&self) -> PrincipalId {
        self.shared.owner
    }

    fn object(&self, id: ObjectId) -> Option<Arc<dyn SceneObject>> {
        self.memory_object(id).filter(|object| object.exists()).map(|object| object as Arc<dyn SceneObject>)
    }

    fn object_by_local_id(&self, local_id: u32) -> Option<Arc<dyn SceneObject>> {
        self.shared
            .objects
            .read()
            .iter()
            .find(|object| object.local_id == local_id && object.exists())
            .cloned()
            .map(|object| object as Arc<dyn SceneObject>)
    }

    fn objects(&self) -> Vec<Arc<dyn SceneObject>> {
        self.shared
            .objects
            .read()
            .iter()
            .filter(|object| object.exists())
            .cloned()
            .map(|object| object as Arc<dyn SceneObject>)
            .collect()
    }

    fn create_object(
        &self,
        owner: PrincipalId,
        name: &str,
        position: Vector3,
    ) -> Result<Arc<dyn SceneObject>, WorldError> {
        Ok(self.add_object(Uuid::new_v4(), owner, name, position))
    }

    fn remove_object(&self, id: ObjectId) -> bool {
        let mut objects = self.shared.objects.write();
        let Some(index) = objects.iter().position(|object| object.id == id) else {
            return false;
        };
        let object = objects.remove(index);
        object.removed.store(true, Ordering::Release);
        true
    }

    fn avatars(&self) -> Vec<AvatarInfo> {
        self.shared.avatars.read().clone()
    }

    fn parcels(&self) -> Vec<ParcelInfo> {
        self.shared.parcels.read().clone()
    }

    fn terrain(&self) -> Arc<dyn Heightmap> {
        self.shared.terrain.clone()
    }

    fn persistence(&self) -> Arc<dyn PersistenceStore> {
        self.shared.stores.clone()
    }

    fn assets(&self) -> Arc<dyn AssetStore> {
        self.shared.stores.clone()
    }

    fn subscribe_chat(&self, listener: ChatListener) -> ListenerId {
        self.shared.chat.lock().add(listener)
    }

    fn unsubscribe_chat(&self, id: ListenerId) {
        self.shared.chat.lock().remove(id);
    }

    fn subscribe_new_user(&self, listener: NewUserListener) -> ListenerId {
        self.shared.new_user.lock().add(listener)
    }

    fn unsubscribe_new_user(&self, id: ListenerId) {
        self.shared.new_user.lock().remove(id);
    }

    fn principal_name(&self, id: PrincipalId) -> Option<String> {
        self.shared.principals.read().get(&id).map(|(name, _)| name.clone())
    }

    fn is_online(&self, id: PrincipalId) -> bool {
        self.shared.principals.read().get(&id).is_some_and(|(_, online)| *online)
    }

    fn alert(&self, id: PrincipalId, message: &str) {
        self.shared.alerts.lock().push((id, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn object_say_reaches_chat_listeners_and_transcript() {
        let owner = Uuid::new_v4();
        let region = MemoryRegion::new("Test", owner);
        let object = region.add_object(Uuid::new_v4(), owner, "Box", Vector3::default());
        let heard = Arc::new(AtomicUsize::new(0));
        let counter = heard.clone();
        let id = region.subscribe_chat(Arc::new(move |chat: &ChatMessage| {
            assert!(chat.from_object);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        object.say("hello", 0);
        region.unsubscribe_chat(id);
        object.say("again", 0);
        assert_eq!(heard.load(Ordering::SeqCst), 1);
        assert_eq!(region.transcript().len(), 2);
        assert_eq!(region.transcript()[0].sender_name, "Box");
    }

    #[test]
    fn removed_objects_disappear_from_lookups() {
        let owner = Uuid::new_v4();
        let region = MemoryRegion::new("Test", owner);
        let id = Uuid::new_v4();
        let object = region.add_object(id, owner, "Box", Vector3::default());
        assert!(region.object(id).is_some());
        assert!(region.remove_object(id));
        assert!(region.object(id).is_none());
        assert!(!object.exists());
    }

    #[test]
    fn heightmap_bounds_are_checked() {
        let map = MemoryHeightmap::flat(4, 4, 10.0);
        map.set(1, 2, 12.5).expect("in range");
        assert_eq!(map.get(1, 2).expect("in range"), 12.5);
        assert!(matches!(map.get(4, 0), Err(WorldError::OutOfRange { x: 4, y: 0 })));
    }
}
