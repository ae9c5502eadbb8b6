use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use marble_engine::cli::CliOverrides;
use marble_engine::config::ScriptingConfig;
use marble_engine::host::ScriptHost;
use marble_engine::templates::{TemplateKind, TemplateRegistry};
use marble_engine::watch::ScriptWatcher;

fn main() {
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let watch = cli.watch_enabled();
    let config_path =
        cli.config_path().cloned().unwrap_or_else(|| PathBuf::from("assets/config.json"));
    let mut config = ScriptingConfig::load_or_default(&config_path);
    config.apply_overrides(&cli.into_config_overrides());
    if let Err(err) = run(config, watch) {
        eprintln!("Application error: {err:?}");
    }
}

fn run(config: ScriptingConfig, watch: bool) -> Result<()> {
    let mut host = ScriptHost::new(config)?;
    println!("[demo] active theme: {}", host.active_theme());

    let mut balls = TemplateRegistry::new(TemplateKind::Ball);
    let template = balls.load(&mut host, "basic")?;
    for _ in 0..3 {
        template.on_update(0.016);
    }
    template.on_collide((0.0f64, 1.0f64));
    let summary = template.call::<_, String>("Describe", (), String::new());
    println!("[demo] ball 'basic' (id {}): {summary}", template.id());

    if watch {
        return watch_loop(&mut host, &mut balls);
    }

    balls.clear();
    host.shutdown();
    Ok(())
}

/// Reloads edited ball scripts until interrupted.
fn watch_loop(host: &mut ScriptHost, balls: &mut TemplateRegistry) -> Result<()> {
    let mut watcher = ScriptWatcher::new()?;
    if let Some(path) = balls.get("basic").and_then(|template| template.script_path()) {
        watcher.watch_template(path, TemplateKind::Ball, "basic")?;
    }
    println!("[demo] watching for script edits (ctrl-c to quit)");
    loop {
        std::thread::sleep(Duration::from_millis(200));
        for change in watcher.drain_changes() {
            println!(
                "[demo] {} '{}' changed, reloading",
                change.kind.label(),
                change.template
            );
            match balls.load(host, &change.template) {
                Ok(template) => {
                    let summary = template.call::<_, String>("Describe", (), String::new());
                    println!("[demo] reloaded (id {}): {summary}", template.id());
                }
                Err(err) => eprintln!("[demo] reload failed: {err:#}"),
            }
        }
    }
}
