use std::path::{Path, PathBuf};

use kestrel_minimods::harness::{load_fixture, run_fixture_in, FixtureAction, HarnessFixture, HarnessOutput};
use kestrel_minimods::EngineConfig;

fn manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn run(path: &Path) -> HarnessOutput {
    let fixture = load_fixture(path).expect("load fixture");
    run_fixture_in(&fixture, &manifest_dir()).expect("run fixture")
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|line| line.to_string()).collect()
}

#[test]
fn greeter_fixture_plays_out_frame_by_frame() {
    let output = run(&manifest_dir().join("assets/fixtures/greeter.json"));

    assert_eq!(output.frames, 3);
    assert_eq!(output.results.len(), 3);
    assert_eq!(
        output.results[0].chat,
        lines(&[
            "Welcome Mat [0]: Greeter ready",
            "Welcome Mat [0]: Hello Bob Jones (#1)",
            "Abacus [0]: tick 2",
            "Abacus [0]: tick 4",
        ])
    );
    assert_eq!(
        output.results[1].chat,
        lines(&["Welcome Mat [0]: Welcome Carol White", "Bob Jones [0]: ping", "Welcome Mat [0]: pong"])
    );
    assert!(output.results[2].chat.is_empty());

    let replies = &output.results[2].replies;
    assert_eq!(replies[0], "2 MRM scripts running in Harness.");
    assert!(replies[2].starts_with("AliceSmith.Abacus.counter "));
    assert!(replies[3].starts_with("AliceSmith.WelcomeMat.greeter "));

    let names: Vec<&str> = output.scripts.iter().map(|script| script.name.as_str()).collect();
    assert_eq!(names, vec!["AliceSmith.Abacus.counter", "AliceSmith.WelcomeMat.greeter"]);
    assert!(output.scripts.iter().all(|script| script.state == "running" && script.errors.is_empty()));
    assert!(output.alerts.is_empty());
    assert_eq!(output.counters.worlds_current, 2);
}

#[test]
fn runs_are_repeatable() {
    let path = manifest_dir().join("assets/fixtures/greeter.json");
    let first = run(&path);
    let second = run(&path);
    assert_eq!(first, second, "harness output should be deterministic");
}

#[test]
fn faults_show_up_in_the_summary() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut fixture: HarnessFixture = serde_json::from_str(
        r#"{
            "owner": "Alice Smith",
            "frames": 2,
            "modules": [{ "path": "assets/minimods/faulty.rhai", "object": "Trap" }],
            "events": [{ "frame": 1, "action": "touch", "object": "Trap", "avatar": "Bob Jones" }]
        }"#,
    )
    .expect("parse fixture");
    fixture.config = Some(EngineConfig { artifact_root: dir.path().to_path_buf(), ..EngineConfig::default() });
    assert!(matches!(fixture.events[0].action, FixtureAction::Touch { .. }));

    let output = run_fixture_in(&fixture, &manifest_dir()).expect("run fixture");
    let script = &output.scripts[0];
    assert_eq!(script.name, "AliceSmith.Trap.faulty");
    assert_eq!(script.state, "stopped");
    assert!(script.errors.iter().any(|line| line.contains("touched the wrong thing")), "{:?}", script.errors);
    assert!(output.alerts.contains(&"Problem while running AliceSmith.Trap.faulty.".to_string()));
}
