mod common;

use std::fs;

use common::{Rig, COUNTER, GREETER};
use kestrel_minimods::compile::declarations::SourceKind;
use kestrel_minimods::sandbox::SandboxKind;
use kestrel_minimods::ScriptState;
use uuid::Uuid;

fn external_rig(name: &str) -> Rig {
    let rig = Rig::with_config(name, |config| config.external_enabled = true);
    let mods = rig.dir.path().join("mods");
    fs::create_dir_all(&mods).expect("mods dir");
    fs::write(mods.join("greeter.rhai"), GREETER).expect("write greeter");
    fs::write(mods.join("counter.rhai"), COUNTER).expect("write counter");
    rig
}

#[test]
fn external_modules_need_to_be_enabled() {
    let rig = Rig::new("Closed");
    let item = Uuid::new_v4();
    assert!(rig.engine.on_script_rez(rig.object, item, "loader", "//MRM:X -a mods/greeter.rhai -c demo.Greeter").is_none());
    assert!(rig.engine.registry().is_empty());
}

#[test]
fn external_module_runs_isolated() {
    let rig = external_rig("External");
    let item = Uuid::new_v4();
    let script = rig
        .engine
        .on_script_rez(rig.object, item, "loader", "//MRM:X -a mods/greeter.rhai -c demo.Greeter")
        .expect("external accepted");
    assert_eq!(script.kind(), SourceKind::External);
    assert_eq!(script.state(), ScriptState::Configured, "{:?}", script.errors());
    let artifact = script.artifact().expect("private artifact");
    assert_eq!(artifact.entry_type(), "demo.Greeter");
    assert!(rig.engine.compiler().cache().is_empty(), "external artifacts bypass the shared cache");

    script.start(None).expect("start");
    assert_eq!(script.sandbox_kind(), Some(SandboxKind::Isolated));
    assert_eq!(rig.chat_lines(), vec!["Box: Greeter ready".to_string()]);

    script.dispose(None).expect("dispose");
    assert!(!artifact.is_on_disk());
}

#[test]
fn trailing_words_become_start_arguments() {
    let rig = external_rig("Arguments");
    let item = Uuid::new_v4();
    let script = rig
        .engine
        .on_script_rez(rig.object, item, "loader", "//MRM:X -a mods/counter.rhai -c Counter 2")
        .expect("external accepted");
    script.start(None).expect("start");
    rig.engine.on_frame();
    assert_eq!(rig.chat_lines(), vec!["Box: tick 2".to_string()]);
}

#[test]
fn config_file_supplies_module_and_entry_type() {
    let rig = external_rig("ConfigFile");
    let config = rig.dir.path().join("mods").join("xmrm.json");
    fs::write(&config, r#"{ "external": { "assembly": "counter.rhai", "class": "Counter" } }"#).expect("write config");
    let item = Uuid::new_v4();
    let script = rig
        .engine
        .on_script_rez(rig.object, item, "loader", "//MRM:X -f mods/xmrm.json")
        .expect("external accepted");
    assert_eq!(script.state(), ScriptState::Configured, "{:?}", script.errors());
    assert_eq!(script.artifact().expect("artifact").entry_type(), "Counter");
}

#[test]
fn missing_module_file_leaves_the_script_unconfigured() {
    let rig = external_rig("Missing");
    let item = Uuid::new_v4();
    let script = rig
        .engine
        .on_script_rez(rig.object, item, "loader", "//MRM:X -a mods/absent.rhai -c Absent")
        .expect("registered anyway");
    assert_eq!(script.state(), ScriptState::Unconfigured);
    assert!(script.errors().iter().any(|line| line.contains("Module file does not exist.")), "{:?}", script.errors());
    assert!(script.start(None).is_err());
}

#[test]
fn switching_marker_kind_replaces_the_script() {
    let rig = external_rig("Switch");
    let item = Uuid::new_v4();
    let inline = rig.engine.on_script_rez(rig.object, item, "loader", GREETER).expect("inline");
    let external = rig
        .engine
        .on_script_rez(rig.object, item, "loader", "//MRM:X -a mods/greeter.rhai -c demo.Greeter")
        .expect("external");
    assert_eq!(inline.state(), ScriptState::Disposed);
    assert_eq!(external.kind(), SourceKind::External);
    assert_eq!(rig.engine.registry().len(), 1);
}
