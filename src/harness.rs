//! Runs modules against a [`MemoryRegion`] from a JSON fixture and reports what they did.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::CounterSnapshot;
use crate::config::EngineConfig;
use crate::engine::ScriptEngine;
use crate::memory::MemoryRegion;
use crate::region::{ObjectId, PrincipalId, Vector3, NO_PRINCIPAL};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_frames")]
    pub frames: usize,
    #[serde(default)]
    pub config: Option<EngineConfig>,
    pub modules: Vec<FixtureModule>,
    #[serde(default)]
    pub events: Vec<FixtureEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureModule {
    pub path: String,
    /// Host object name. Objects are created on first mention, owned by the fixture owner.
    pub object: String,
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default = "default_start")]
    pub start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureEvent {
    /// Fired before the frame with this number (1-based) runs.
    pub frame: usize,
    #[serde(flatten)]
    pub action: FixtureAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixtureAction {
    Arrive { avatar: String },
    Touch { object: String, avatar: String },
    Chat { avatar: String, message: String, #[serde(default)] channel: i64 },
    /// Runs a command line as the fixture owner, or as the console when `console` is set.
    Command { line: String, #[serde(default)] console: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub frames: usize,
    pub modules: Vec<String>,
    pub results: Vec<FrameResult>,
    pub scripts: Vec<ScriptSummary>,
    pub alerts: Vec<String>,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameResult {
    pub frame: usize,
    pub chat: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptSummary {
    pub name: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

fn default_region() -> String {
    "Harness".to_string()
}

fn default_owner() -> String {
    "Harness Owner".to_string()
}

fn default_frames() -> usize {
    1
}

fn default_start() -> bool {
    true
}

/// Principal ids derived from names so output stays stable between runs.
fn principal(name: &str) -> PrincipalId {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("principal:{name}").as_bytes())
}

fn object_id(name: &str) -> ObjectId {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("object:{name}").as_bytes())
}

fn item_id(object: &str, item: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("item:{object}/{item}").as_bytes())
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening fixture '{}'", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("parsing fixture JSON '{}'", path.display()))
}

/// Runs `fixture` with module paths relative to the current directory.
pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    run_fixture_in(fixture, &cwd)
}

pub fn run_fixture_in(fixture: &HarnessFixture, base_dir: &Path) -> Result<HarnessOutput> {
    let owner = principal(&fixture.owner);
    let region = MemoryRegion::new(&fixture.region, owner);
    region.add_principal(owner, &fixture.owner, true);

    let mut config = fixture.config.clone().unwrap_or_default();
    if fixture.config.is_none() {
        config.artifact_root = std::env::temp_dir().join("kestrel_minimods_harness");
    }
    let timeout = config.stop_timeout();
    let engine = ScriptEngine::with_working_dir(config, Arc::new(region.clone()), base_dir.to_path_buf());

    let mut objects: HashMap<String, ObjectId> = HashMap::new();
    let mut ensure_object = |name: &str| -> ObjectId {
        *objects.entry(name.to_string()).or_insert_with(|| {
            let id = object_id(name);
            region.add_object(id, owner, name, Vector3::new(128.0, 128.0, 21.0));
            id
        })
    };

    for module in &fixture.modules {
        let path = resolve(base_dir, &module.path);
        let text = fs::read_to_string(&path).with_context(|| format!("reading module '{}'", path.display()))?;
        let item_name = match &module.item {
            Some(item) => item.clone(),
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("module path '{}' has no file name", path.display()))?,
        };
        let host = ensure_object(&module.object);
        let item = item_id(&module.object, &item_name);
        if engine.on_script_rez(host, item, &item_name, &text).is_none() {
            tracing::warn!("[harness] '{}' was not accepted as a module", path.display());
            continue;
        }
        if module.start {
            if let Err(err) = engine.start_now(item, None) {
                tracing::warn!("[harness] unable to start '{}': {err}", path.display());
            }
        }
    }

    let mut results = Vec::with_capacity(fixture.frames);
    let mut seen_chat = 0;
    for frame in 1..=fixture.frames {
        let mut replies = Vec::new();
        for event in fixture.events.iter().filter(|event| event.frame == frame) {
            match &event.action {
                FixtureAction::Arrive { avatar } => {
                    region.arrive(principal(avatar), avatar, Vector3::new(128.0, 130.0, 21.0));
                }
                FixtureAction::Touch { object, avatar } => {
                    let target = ensure_object(object);
                    let who = principal(avatar);
                    region.add_principal(who, avatar, true);
                    region.touch(target, who).with_context(|| format!("touching '{object}'"))?;
                }
                FixtureAction::Chat { avatar, message, channel } => {
                    let who = principal(avatar);
                    region.add_principal(who, avatar, true);
                    region.chat_from(who, message, *channel);
                }
                FixtureAction::Command { line, console } => {
                    let requester = if *console { NO_PRINCIPAL } else { owner };
                    replies.extend(engine.run_command(line, requester));
                }
            }
            engine.wait_idle(timeout);
        }
        engine.on_frame();
        let transcript = region.transcript();
        let chat = transcript[seen_chat.min(transcript.len())..]
            .iter()
            .map(|record| format!("{} [{}]: {}", record.sender_name, record.channel, record.message))
            .collect();
        seen_chat = transcript.len();
        results.push(FrameResult { frame, chat, replies });
    }

    engine.wait_idle(timeout);
    let scripts = engine
        .registry()
        .snapshot()
        .into_iter()
        .map(|(name, script)| ScriptSummary { name, state: script.state().to_string(), errors: script.errors() })
        .collect();
    let counters = engine.counters();
    let alerts = region.alerts().into_iter().map(|(_, message)| message).collect();
    engine.close();

    Ok(HarnessOutput {
        frames: fixture.frames,
        modules: fixture.modules.iter().map(|module| module.path.clone()).collect(),
        results,
        scripts,
        alerts,
        counters,
    })
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_defaults_apply() {
        let fixture: HarnessFixture =
            serde_json::from_str(r#"{ "modules": [{ "path": "a.rhai", "object": "Box" }] }"#).expect("parse fixture");
        assert_eq!(fixture.region, "Harness");
        assert_eq!(fixture.frames, 1);
        assert!(fixture.modules[0].start);
        assert!(fixture.events.is_empty());
    }

    #[test]
    fn events_are_tagged_by_action() {
        let event: FixtureEvent =
            serde_json::from_str(r#"{ "frame": 2, "action": "touch", "object": "Box", "avatar": "Bob" }"#)
                .expect("parse event");
        assert_eq!(event.frame, 2);
        assert_eq!(event.action, FixtureAction::Touch { object: "Box".into(), avatar: "Bob".into() });
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(principal("Bob"), principal("Bob"));
        assert_ne!(principal("Bob"), principal("Alice"));
        assert_ne!(item_id("Box", "a"), item_id("Crate", "a"));
    }
}
