//! Narrow interfaces to the host world.
//!
//! The engine never owns world data. Everything a module can see or change is reached through
//! these traits, which the capability wrappers forward to after their own checks.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorldError;

pub type ObjectId = Uuid;
pub type PrincipalId = Uuid;
pub type ListenerId = u64;

/// Host-initiated requests carry this principal and bypass ownership checks.
pub const NO_PRINCIPAL: PrincipalId = Uuid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:.2}, {:.2}, {:.2}>", self.x, self.y, self.z)
    }
}

/// The identity a script acts as when it touches the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential {
    pub principal: PrincipalId,
    pub god: bool,
}

impl Credential {
    pub fn new(principal: PrincipalId, god: bool) -> Self {
        Self { principal, god }
    }

    pub fn can_edit(&self, owner: PrincipalId) -> bool {
        self.god || self.principal == owner
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarInfo {
    pub id: PrincipalId,
    pub name: String,
    pub position: Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelInfo {
    pub id: Uuid,
    pub name: String,
    pub owner: PrincipalId,
    pub area: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TouchEvent {
    pub object: ObjectId,
    pub avatar: AvatarInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub sender: Uuid,
    pub sender_name: String,
    pub message: String,
    pub channel: i64,
    pub from_object: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserEvent {
    pub avatar: AvatarInfo,
}

impl fmt::Display for TouchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Touch object={} avatar={}", self.object, self.avatar.name)
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chat channel={} from={} message={}", self.channel, self.sender_name, self.message)
    }
}

impl fmt::Display for NewUserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NewUser avatar={}", self.avatar.name)
    }
}

pub type TouchListener = Arc<dyn Fn(&TouchEvent) + Send + Sync>;
pub type ChatListener = Arc<dyn Fn(&ChatMessage) + Send + Sync>;
pub type NewUserListener = Arc<dyn Fn(&NewUserEvent) + Send + Sync>;

pub trait SceneObject: Send + Sync {
    fn id(&self) -> ObjectId;
    fn local_id(&self) -> u32;
    fn owner(&self) -> PrincipalId;
    fn exists(&self) -> bool;
    fn name(&self) -> String;
    fn set_name(&self, name: &str);
    fn description(&self) -> String;
    fn set_description(&self, description: &str);
    fn text(&self) -> String;
    fn set_text(&self, text: &str);
    fn position(&self) -> Vector3;
    fn set_position(&self, position: Vector3);
    fn say(&self, message: &str, channel: i64);
    fn subscribe_touch(&self, listener: TouchListener) -> ListenerId;
    fn unsubscribe_touch(&self, id: ListenerId);
}

pub trait Heightmap: Send + Sync {
    fn width(&self) -> i64;
    fn length(&self) -> i64;
    fn get(&self, x: i64, y: i64) -> Result<f64, WorldError>;
    fn set(&self, x: i64, y: i64, height: f64) -> Result<(), WorldError>;
}

/// Per-script key/value storage.
pub trait PersistenceStore: Send + Sync {
    fn get(&self, script: Uuid, key: &str) -> Option<String>;
    fn put(&self, script: Uuid, key: &str, value: &str);
}

pub trait AssetStore: Send + Sync {
    fn save_bitmap(&self, owner: PrincipalId, bytes: &[u8], lossless: bool, temporary: bool) -> Uuid;
    fn load_bitmap(&self, id: Uuid) -> Result<Vec<u8>, WorldError>;
}

pub trait RegionWorld: Send + Sync {
    fn region_id(&self) -> Uuid;
    fn region_name(&self) -> String;
    fn region_owner(&self) -> PrincipalId;

    fn object(&self, id: ObjectId) -> Option<Arc<dyn SceneObject>>;
    fn object_by_local_id(&self, local_id: u32) -> Option<Arc<dyn SceneObject>>;
    fn objects(&self) -> Vec<Arc<dyn SceneObject>>;
    fn create_object(&self, owner: PrincipalId, name: &str, position: Vector3)
        -> Result<Arc<dyn SceneObject>, WorldError>;
    fn remove_object(&self, id: ObjectId) -> bool;

    fn avatars(&self) -> Vec<AvatarInfo>;
    fn parcels(&self) -> Vec<ParcelInfo>;
    fn terrain(&self) -> Arc<dyn Heightmap>;
    fn persistence(&self) -> Arc<dyn PersistenceStore>;
    fn assets(&self) -> Arc<dyn AssetStore>;

    fn subscribe_chat(&self, listener: ChatListener) -> ListenerId;
    fn unsubscribe_chat(&self, id: ListenerId);
    fn subscribe_new_user(&self, listener: NewUserListener) -> ListenerId;
    fn unsubscribe_new_user(&self, id: ListenerId);

    fn principal_name(&self, id: PrincipalId) -> Option<String>;
    fn is_online(&self, id: PrincipalId) -> bool;
    fn alert(&self, id: PrincipalId, message: &str);

    /// Display name used in logs and refusals; falls back to the raw id.
    fn display_name(&self, id: PrincipalId) -> String {
        if id == NO_PRINCIPAL {
            return "host".to_string();
        }
        self.principal_name(id).unwrap_or_else(|| id.to_string())
    }
}
