mod common;

use std::time::Duration;

use common::{eventually, Rig, GREETER};
use kestrel_minimods::capability::dispatch::DispatchMode;
use kestrel_minimods::region::SceneObject;
use uuid::Uuid;

const PROBE: &str = r#"//MRM:rhai
//@module Probe : MiniModule
fn init(world, host, id) {
    this.world = world;
    this.host = host;
}

fn start(args) {
    let object = this.host.object;
    let again = this.world.objects.get(object.id);
    if object == again {
        object.say("same proxy");
    } else {
        object.say("different proxy");
    }
    let shed = this.world.objects.find("Neighbour Shed")[0];
    try {
        shed.text = "claimed";
        object.say("edited shed");
    } catch {
        object.say("shed refused");
    }
}

fn stop() {}
"#;

const VAULT: &str = r#"//MRM:rhai
//@module Vault : MiniModule
fn init(world, host, id) {
    this.host = host;
}

fn start(args) {
    let object = this.host.object;
    try {
        let store = this.host.persistence;
        store.put("visits", "1");
        object.say(`stored ${store.get("visits")}`);
    } catch {
        object.say("no persistence");
    }
}

fn stop() {}
"#;

const ECHO: &str = r#"//MRM:rhai
//@module Echo : MiniModule
fn init(world, host, id) {
    this.world = world;
    this.host = host;
}

fn start(args) {
    this.world.on_chat(Fn("heard"));
    this.host.object.on_touch(Fn("touched"));
}

fn touched(event) {
    let object = this.host.object;
    object.text = object.text + "|touch-begin";
    object.say("first");
    object.say("second");
    object.text = object.text + "|touch-end";
}

fn heard(event) {
    if event.from_object {
        let object = this.host.object;
        object.text = object.text + "|heard:" + event.message;
    }
}

fn stop() {}
"#;

const QUIET: &str = "//MRM:rhai\n//@module Quiet : MiniModule\nfn start(args) {}\nfn stop() {}\n";

fn start(rig: &Rig, item_name: &str, source: &str) {
    let item = Uuid::new_v4();
    rig.engine.on_script_rez(rig.object, item, item_name, source).expect("module accepted");
    rig.engine.start_now(item, None).expect("module starts");
}

#[test]
fn listeners_attach_only_when_a_handler_is_added() {
    let rig = Rig::with_config("Lazy", |config| config.hidden = true);
    start(&rig, "quiet", QUIET);
    assert_eq!(rig.region.chat_listener_count(), 0);
    assert_eq!(rig.region.new_user_listener_count(), 0);
    assert_eq!(rig.region.memory_object(rig.object).expect("box").touch_listener_count(), 0);

    start(&rig, "greeter", GREETER);
    assert_eq!(rig.region.chat_listener_count(), 1);
    assert_eq!(rig.region.new_user_listener_count(), 1);
    assert_eq!(rig.region.memory_object(rig.object).expect("box").touch_listener_count(), 1);
    let counters = rig.engine.counters();
    assert_eq!(counters.chat_listeners, 1);
    assert_eq!(counters.touch_listeners, 1);
    assert_eq!(counters.worlds_current, 2);
}

#[test]
fn one_object_is_one_proxy_and_foreign_objects_are_read_only() {
    let rig = Rig::new("Proxies");
    let neighbour = rig.add_avatar("Nadia Brown");
    let shed = rig.add_object(neighbour, "Neighbour Shed");
    start(&rig, "probe", PROBE);

    let lines = rig.chat_lines();
    assert!(lines.contains(&"Box: same proxy".to_string()), "{lines:?}");
    assert!(lines.contains(&"Box: shed refused".to_string()), "{lines:?}");
    assert_eq!(rig.region.memory_object(shed).expect("shed").text(), "");
}

#[test]
fn god_scripts_may_edit_anything() {
    let rig = Rig::with_config("Gods", |config| config.god_scripts = true);
    let neighbour = rig.add_avatar("Nadia Brown");
    let shed = rig.add_object(neighbour, "Neighbour Shed");
    start(&rig, "probe", PROBE);

    assert!(rig.chat_lines().contains(&"Box: edited shed".to_string()), "{:?}", rig.chat_lines());
    assert_eq!(rig.region.memory_object(shed).expect("shed").text(), "claimed");
}

#[test]
fn trust_policy_decides_what_a_module_may_reach() {
    let denied = Rig::new("Internet");
    start(&denied, "vault", VAULT);
    assert_eq!(denied.chat_lines(), vec!["Box: no persistence".to_string()]);

    let granted = Rig::with_config("Intranet", |config| config.sandbox_policy = "localintranet".to_string());
    start(&granted, "vault", VAULT);
    assert_eq!(granted.chat_lines(), vec!["Box: stored 1".to_string()]);
}

#[test]
fn events_raised_by_a_handler_run_after_it_returns() {
    let rig = Rig::new("Reentrancy");
    start(&rig, "echo", ECHO);
    let visitor = rig.add_avatar("Bob Jones");
    rig.region.touch(rig.object, visitor).expect("touch");

    let text = rig.region.memory_object(rig.object).expect("box").text();
    assert_eq!(text, "|touch-begin|touch-end|heard:first|heard:second");
}

#[test]
fn queued_dispatch_delivers_in_order_on_a_worker() {
    let rig = Rig::with_config("Queued", |config| config.event_dispatch = DispatchMode::Queued);
    start(&rig, "echo", ECHO);
    let visitor = rig.add_avatar("Bob Jones");
    rig.region.touch(rig.object, visitor).expect("touch");

    let object = rig.region.memory_object(rig.object).expect("box");
    let expected = "|touch-begin|touch-end|heard:first|heard:second";
    assert!(eventually(|| object.text() == expected), "text was '{}'", object.text());
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(object.text(), expected);
}

#[test]
fn stopping_detaches_handlers_so_later_events_are_ignored() {
    let rig = Rig::with_config("Detach", |config| config.hidden = true);
    let item = Uuid::new_v4();
    let script = rig.engine.on_script_rez(rig.object, item, "greeter", GREETER).expect("greeter");
    script.start(None).expect("start");
    script.stop(None).expect("stop");

    let before = rig.chat_lines().len();
    let visitor = rig.add_avatar("Bob Jones");
    rig.region.touch(rig.object, visitor).expect("touch");
    rig.region.chat_from(visitor, "ping", 0);
    assert_eq!(rig.chat_lines().len(), before + 1, "only Bob's own chat was recorded");
    assert_eq!(rig.engine.counters().touch_listeners, 0);
}
