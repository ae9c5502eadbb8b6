use std::fs;
use std::path::{Path, PathBuf};

use marble_engine::{EntityTemplate, ScriptHost, ScriptingConfig, TemplateKind, TemplateRegistry};
use tempfile::TempDir;

fn host_with_root(root: &Path) -> ScriptHost {
    let config = ScriptingConfig {
        resources_root: root.to_path_buf(),
        default_theme: "classic".to_string(),
        script_extension: "lua".to_string(),
    };
    ScriptHost::new(config).expect("script host should initialize")
}

fn write_template(root: &Path, kind: TemplateKind, name: &str, contents: &str) -> PathBuf {
    let path = root
        .join("templates")
        .join(kind.directory())
        .join(format!("{name}.lua"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("template directory should be writable");
    }
    fs::write(&path, contents).expect("template file should be writable");
    path
}

const COUNTING_BALL: &str = "\
openlib(\"base\")

function OnInit()
    counter = 0
end

function OnUpdate(dt)
    counter = counter + 1
end

function OnDestroy()
    destroyed = (destroyed or 0) + 1
end
";

#[test]
fn load_runs_on_init_and_assigns_an_id() {
    let dir = TempDir::new().expect("temp dir");
    write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let template = balls.load(&mut host, "basic").expect("template should load");
    assert!(template.is_loaded());
    assert_eq!(template.id(), 1, "ids start at one");
    assert_eq!(template.name(), "basic");
    assert_eq!(template.kind(), TemplateKind::Ball);

    template.on_update(0.016);
    template.on_update(0.016);
    let script = template.script_path().expect("loaded template has a path").to_path_buf();
    let namespace = host.script_namespace(&script).expect("namespace should exist");
    let counter: i64 = namespace.get("counter").expect("counter should be set");
    assert_eq!(counter, 2);
}

#[test]
fn template_ids_are_monotonic() {
    let dir = TempDir::new().expect("temp dir");
    write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    write_template(dir.path(), TemplateKind::Ball, "fast", COUNTING_BALL);
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let first = balls.load(&mut host, "basic").expect("first template").id();
    let second = balls.load(&mut host, "fast").expect("second template").id();
    assert!(second > first, "ids never repeat ({first} then {second})");
}

#[test]
fn reload_runs_destroy_then_init_and_keeps_the_id() {
    let dir = TempDir::new().expect("temp dir");
    let script = write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let template = balls.load(&mut host, "basic").expect("template should load");
    let id = template.id();
    template.on_update(0.016);
    template.on_update(0.016);
    template.on_update(0.016);

    let template = balls.load(&mut host, "basic").expect("second load reloads");
    assert_eq!(template.id(), id, "reload keeps the identity");
    assert_eq!(balls.len(), 1);

    let namespace = host.script_namespace(&script.canonicalize().expect("canonical path"))
        .expect("namespace should exist");
    let counter: i64 = namespace.get("counter").expect("counter should be set");
    assert_eq!(counter, 0, "OnInit ran again");
    let destroyed: i64 = namespace.get("destroyed").expect("destroyed should be set");
    assert_eq!(destroyed, 1, "OnDestroy ran before the re-run");
}

#[test]
fn missing_hooks_are_cached_as_no_ops() {
    let dir = TempDir::new().expect("temp dir");
    write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let template = balls.load(&mut host, "basic").expect("template should load");
    let after_init = template.namespace_probes();

    template.on_render();
    template.on_render();
    template.on_render();
    assert_eq!(
        template.namespace_probes(),
        after_init + 1,
        "an undefined hook is probed once, then served from the cache"
    );

    template.on_update(0.016);
    template.on_update(0.016);
    assert_eq!(
        template.namespace_probes(),
        after_init + 2,
        "a defined hook is also probed only once"
    );
}

#[test]
fn call_falls_back_to_the_default_for_missing_hooks() {
    let dir = TempDir::new().expect("temp dir");
    write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let template = balls.load(&mut host, "basic").expect("template should load");
    let fallback = template.call::<_, i64>("Score", (), 7);
    assert_eq!(fallback, 7);
}

#[test]
fn hook_errors_do_not_poison_the_template() {
    let dir = TempDir::new().expect("temp dir");
    write_template(
        dir.path(),
        TemplateKind::Ball,
        "faulty",
        "openlib(\"base\")\n\nfunction OnInit()\n    ticks = 0\nend\n\nfunction OnUpdate(dt)\n    error(\"update exploded\")\nend\n\nfunction OnRender()\n    ticks = ticks + 1\nend\n",
    );
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    let template = balls.load(&mut host, "faulty").expect("template should load");
    template.on_update(0.016);
    template.on_render();

    let script = template.script_path().expect("loaded template has a path").to_path_buf();
    let namespace = host.script_namespace(&script).expect("namespace should exist");
    let ticks: i64 = namespace.get("ticks").expect("ticks should be set");
    assert_eq!(ticks, 1, "later hooks still run after a guest error");
}

#[test]
fn block_hooks_dispatch_with_their_side() {
    let dir = TempDir::new().expect("temp dir");
    write_template(
        dir.path(),
        TemplateKind::Block,
        "ramp",
        "openlib(\"base\")\n\nfunction OnBlockConstruct()\n    constructed = true\nend\n\nfunction OnBlockSideConstruct(side)\n    last_side = side\nend\n",
    );
    let mut host = host_with_root(dir.path());
    let mut blocks = TemplateRegistry::new(TemplateKind::Block);

    let template = blocks.load(&mut host, "ramp").expect("block should load");
    template.on_block_construct();
    template.on_block_side_construct(3);

    let script = template.script_path().expect("loaded template has a path").to_path_buf();
    let namespace = host.script_namespace(&script).expect("namespace should exist");
    let constructed: bool = namespace.get("constructed").expect("constructed should be set");
    assert!(constructed);
    let last_side: i64 = namespace.get("last_side").expect("last_side should be set");
    assert_eq!(last_side, 3);
}

#[test]
fn failed_loads_leave_no_registry_entry() {
    let dir = TempDir::new().expect("temp dir");
    let mut host = host_with_root(dir.path());
    let mut balls = TemplateRegistry::new(TemplateKind::Ball);

    assert!(
        balls.load(&mut host, "does_not_exist").is_err(),
        "missing script should fail the load"
    );
    assert!(balls.is_empty(), "no half-registered entry survives a failure");
    assert!(balls.get("does_not_exist").is_none());
}

#[test]
fn loading_a_loaded_template_twice_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());

    let mut template = EntityTemplate::new("basic", TemplateKind::Ball);
    template.load(&mut host).expect("first load should succeed");
    template.load(&mut host).expect_err("second load without reload should fail");
}

#[test]
fn unload_runs_destroy_and_detaches() {
    let dir = TempDir::new().expect("temp dir");
    let script = write_template(dir.path(), TemplateKind::Ball, "basic", COUNTING_BALL);
    let mut host = host_with_root(dir.path());

    let mut template = EntityTemplate::new("basic", TemplateKind::Ball);
    template.load(&mut host).expect("load should succeed");
    template.unload();
    assert!(!template.is_loaded());

    let namespace = host.script_namespace(&script.canonicalize().expect("canonical path"))
        .expect("the script unit outlives the template");
    let destroyed: i64 = namespace.get("destroyed").expect("destroyed should be set");
    assert_eq!(destroyed, 1);
}
