#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kestrel_minimods::memory::MemoryRegion;
use kestrel_minimods::region::{ObjectId, PrincipalId, Vector3};
use kestrel_minimods::{EngineConfig, ScriptEngine};
use tempfile::TempDir;
use uuid::Uuid;

pub const GREETER: &str = include_str!("../../assets/minimods/greeter.rhai");
pub const COUNTER: &str = include_str!("../../assets/minimods/counter.rhai");
pub const FAULTY: &str = include_str!("../../assets/minimods/faulty.rhai");
pub const STUBBORN: &str = include_str!("../../assets/minimods/stubborn.rhai");

pub struct Rig {
    pub dir: TempDir,
    pub region: MemoryRegion,
    pub engine: Arc<ScriptEngine>,
    pub owner: PrincipalId,
    pub object: ObjectId,
}

impl Rig {
    pub fn new(region_name: &str) -> Self {
        Self::with_config(region_name, |_| {})
    }

    /// A region owned by "Alice Smith" (online) holding one object, "Box", that she owns.
    pub fn with_config(region_name: &str, configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let owner = Uuid::new_v4();
        let region = MemoryRegion::new(region_name, owner);
        region.add_principal(owner, "Alice Smith", true);
        let object = Uuid::new_v4();
        region.add_object(object, owner, "Box", Vector3::new(128.0, 128.0, 21.0));

        let mut config = EngineConfig { artifact_root: dir.path().join("artifacts"), ..EngineConfig::default() };
        configure(&mut config);
        let engine = ScriptEngine::with_working_dir(config, Arc::new(region.clone()), dir.path().to_path_buf());
        Self { dir, region, engine, owner, object }
    }

    pub fn add_object(&self, owner: PrincipalId, name: &str) -> ObjectId {
        let id = Uuid::new_v4();
        self.region.add_object(id, owner, name, Vector3::new(120.0, 120.0, 21.0));
        id
    }

    pub fn add_avatar(&self, name: &str) -> PrincipalId {
        let id = Uuid::new_v4();
        self.region.arrive(id, name, Vector3::new(128.0, 130.0, 21.0));
        id
    }

    pub fn chat_lines(&self) -> Vec<String> {
        self.region
            .transcript()
            .into_iter()
            .map(|record| format!("{}: {}", record.sender_name, record.message))
            .collect()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.region.alerts().into_iter().map(|(_, message)| message).collect()
    }
}

/// Polls `condition` until it holds or five seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
