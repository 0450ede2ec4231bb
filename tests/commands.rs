mod common;

use std::time::{Duration, Instant};

use common::{Rig, COUNTER, GREETER, STUBBORN};
use kestrel_minimods::region::NO_PRINCIPAL;
use kestrel_minimods::ScriptState;
use uuid::Uuid;

fn two_scripts(rig: &Rig) -> (Uuid, Uuid) {
    let (greeter, counter) = (Uuid::new_v4(), Uuid::new_v4());
    rig.engine.on_script_rez(rig.object, greeter, "greeter", GREETER).expect("greeter");
    rig.engine.on_script_rez(rig.object, counter, "counter", COUNTER).expect("counter");
    rig.engine.start_now(greeter, None).expect("start greeter");
    rig.engine.start_now(counter, None).expect("start counter");
    (greeter, counter)
}

fn state(rig: &Rig, item: Uuid) -> ScriptState {
    rig.engine.script(item).expect("script").state()
}

fn settle(rig: &Rig) {
    assert!(rig.engine.wait_idle(Duration::from_secs(5)), "lifecycle work did not finish");
}

#[test]
fn list_shows_scripts_to_their_owner_and_the_console() {
    let rig = Rig::new("Listing");
    two_scripts(&rig);

    let lines = rig.engine.run_command("mrm list", NO_PRINCIPAL);
    assert_eq!(lines[0], "2 MRM scripts running in Listing.");
    assert!(lines[1].starts_with("Name "));
    assert!(lines[2].starts_with("AliceSmith.Box.counter "));
    assert!(lines[2].contains("Alice Smith"));
    assert!(lines[2].ends_with("true"));
    assert!(lines[3].starts_with("AliceSmith.Box.greeter "));

    assert_eq!(rig.engine.run_command("mrm list", rig.owner).len(), 4);
    let stranger = rig.add_avatar("Mallory Black");
    assert_eq!(rig.engine.run_command("mrm list", stranger).len(), 2, "header rows only");
}

#[test]
fn named_and_selected_targets() {
    let rig = Rig::new("Targets");
    let (greeter, counter) = two_scripts(&rig);

    assert!(rig.engine.run_command("mrm stop AliceSmith.Box.greeter", rig.owner).is_empty());
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Stopped);
    assert_eq!(state(&rig, counter), ScriptState::Running);

    let replies = rig.engine.run_command("mrm stop", rig.owner);
    assert!(replies.is_empty(), "nothing selected, nothing happens");
    settle(&rig);
    assert_eq!(state(&rig, counter), ScriptState::Running);

    let replies = rig.engine.run_command("mrm select AliceSmith.Box.counter", rig.owner);
    assert_eq!(replies, vec!["[MRM]: 'AliceSmith.Box.counter' selected.".to_string()]);
    rig.engine.run_command("mrm stop", rig.owner);
    settle(&rig);
    assert_eq!(state(&rig, counter), ScriptState::Stopped);

    rig.engine.run_command("mrm select all", rig.owner);
    rig.engine.run_command("mrm start", rig.owner);
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Running);
    assert_eq!(state(&rig, counter), ScriptState::Running);

    rig.engine.run_command("mrm reset", rig.owner);
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Running);
    assert_eq!(rig.chat_lines().iter().filter(|line| line.ends_with("Greeter ready")).count(), 3);

    rig.engine.run_command("mrm dispose AliceSmith.Box.greeter", rig.owner);
    settle(&rig);
    assert!(rig.engine.script(greeter).is_none());
    assert_eq!(rig.engine.registry().len(), 1);
}

#[test]
fn unknown_names_and_commands_are_reported() {
    let rig = Rig::new("Unknown");
    two_scripts(&rig);

    let replies = rig.engine.run_command("mrm select Nobody.Nothing.none", rig.owner);
    assert_eq!(replies, vec!["[MRM]: Unable to select script. 'Nobody.Nothing.none' is not a known script.".to_string()]);
    let replies = rig.engine.run_command("mrm stop Nobody.Nothing.none", rig.owner);
    assert_eq!(replies, vec!["[XMRM]: Unable to stop script. 'Nobody.Nothing.none' is not a known script.".to_string()]);
    let replies = rig.engine.run_command("mrm dance", rig.owner);
    assert_eq!(replies, vec!["dance is not a valid XMRM command. Ignoring.".to_string()]);
    let replies = rig.engine.run_command("mrm", rig.owner);
    assert_eq!(replies, vec!["[XMRM]: Ignoring XMRM command. No command specified.".to_string()]);
}

#[test]
fn strangers_cannot_stop_other_peoples_scripts() {
    let rig = Rig::new("Strangers");
    let (greeter, _) = two_scripts(&rig);
    let stranger = rig.add_avatar("Mallory Black");

    rig.engine.run_command("mrm stop AliceSmith.Box.greeter", stranger);
    rig.engine.run_command("mrm dispose AliceSmith.Box.greeter", stranger);
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Running);
}

#[test]
fn region_filter_limits_which_engine_listens() {
    let rig = Rig::new("Filtered");
    let (greeter, _) = two_scripts(&rig);

    let replies = rig.engine.run_command("mrm region Elsewhere", NO_PRINCIPAL);
    assert_eq!(replies, vec!["[XMRM]: Commands restricted to region 'Elsewhere'.".to_string()]);
    assert!(rig.engine.run_command("mrm stop AliceSmith.Box.greeter", NO_PRINCIPAL).is_empty());
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Running);
    assert!(rig.engine.run_command("mrm list", NO_PRINCIPAL).is_empty());

    let replies = rig.engine.run_command("mrm region all", NO_PRINCIPAL);
    assert_eq!(replies, vec!["[XMRM]: Commands affect every region.".to_string()]);
    rig.engine.run_command("mrm region Filtered", NO_PRINCIPAL);
    rig.engine.run_command("mrm stop AliceSmith.Box.greeter", NO_PRINCIPAL);
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Stopped);
}

#[test]
fn stats_report_live_counts() {
    let rig = Rig::with_config("Stats", |config| config.hidden = true);
    two_scripts(&rig);

    let lines = rig.engine.run_command("mrm stats", NO_PRINCIPAL);
    assert_eq!(lines[0], "Stats stats for 2 scripts:");
    assert_eq!(lines[1], format!("Worlds    - Total: {:>10} - Current 2", 2));
    assert_eq!(lines[3], format!("Listeners - Touch: {:>10} - Chat 1 - New user 1", 1));
}

#[test]
fn owners_can_command_through_chat_unless_hidden() {
    let rig = Rig::new("Chatty");
    let (greeter, _) = two_scripts(&rig);
    rig.region.chat_from(rig.owner, "XMRM stop AliceSmith.Box.greeter", 0);
    settle(&rig);
    assert_eq!(state(&rig, greeter), ScriptState::Stopped);

    let hidden = Rig::with_config("Hidden", |config| config.hidden = true);
    let (greeter, _) = two_scripts(&hidden);
    hidden.region.chat_from(hidden.owner, "XMRM stop AliceSmith.Box.greeter", 0);
    settle(&hidden);
    assert_eq!(state(&hidden, greeter), ScriptState::Running);
}

#[test]
fn stop_and_dispose_commands_leave_the_caller_free() {
    let rig = Rig::with_config("Offloaded", |config| {
        config.sandbox_policy = "fulltrust".to_string();
        config.stop_timeout_ms = 1_500;
    });
    let item = Uuid::new_v4();
    rig.engine.on_script_rez(rig.object, item, "stubborn", STUBBORN).expect("stubborn");
    rig.engine.start_now(item, None).expect("start stubborn");

    let began = Instant::now();
    assert!(rig.engine.run_command("mrm stop AliceSmith.Box.stubborn", NO_PRINCIPAL).is_empty());
    assert!(began.elapsed() < Duration::from_millis(500), "stop command held the caller for {:?}", began.elapsed());
    settle(&rig);
    let script = rig.engine.script(item).expect("still registered");
    assert_eq!(script.state(), ScriptState::Stopped);
    assert!(script.errors().iter().any(|line| line.contains("did not stop")), "{:?}", script.errors());

    rig.engine.start_now(item, None).expect("start again");
    let began = Instant::now();
    rig.engine.run_command("mrm dispose AliceSmith.Box.stubborn", NO_PRINCIPAL);
    assert!(began.elapsed() < Duration::from_millis(500), "dispose command held the caller for {:?}", began.elapsed());
    settle(&rig);
    assert_eq!(script.state(), ScriptState::Disposed);
    assert!(rig.engine.script(item).is_none());
}
