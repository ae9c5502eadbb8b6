use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use crate::templates::TemplateKind;

/// An edited template source, mapped back to the template that loaded it so
/// the host loop can ask the matching registry for a reload.
#[derive(Debug, Clone)]
pub struct ScriptChange {
    pub path: PathBuf,
    pub kind: TemplateKind,
    pub template: String,
}

pub struct ScriptWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    registrations: Vec<(PathBuf, TemplateKind, String)>,
}

impl ScriptWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure script watcher")?;
        Ok(Self { watcher, rx, registrations: Vec::new() })
    }

    /// Watches one resolved template source. Re-registering the same file is
    /// a no-op.
    pub fn watch_template(
        &mut self,
        source: impl AsRef<Path>,
        kind: TemplateKind,
        template: &str,
    ) -> Result<()> {
        let source = source.as_ref();
        if !source.exists() {
            anyhow::bail!("path '{}' does not exist", source.display());
        }
        let normalized = normalize_watch_path(source);
        if self.registrations.iter().any(|(existing, _, _)| *existing == normalized) {
            return Ok(());
        }
        self.watcher
            .watch(&normalized, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", normalized.display()))?;
        self.registrations.push((normalized, kind, template.to_string()));
        Ok(())
    }

    pub fn drain_changes(&mut self) -> Vec<ScriptChange> {
        let mut changes = Vec::new();
        let mut backlog: VecDeque<notify::Result<Event>> = VecDeque::new();
        while let Ok(event) = self.rx.try_recv() {
            backlog.push_back(event);
        }
        while let Some(event) = backlog.pop_front() {
            match event {
                Ok(event) => {
                    if !Self::is_relevant(&event.kind) {
                        continue;
                    }
                    for path in event.paths {
                        if let Some((kind, template)) = self.registration_for(&path) {
                            changes.push(ScriptChange { path, kind, template });
                        }
                    }
                }
                Err(err) => eprintln!("[watch] script watcher error: {err}"),
            }
        }
        changes
    }

    fn registration_for(&self, path: &Path) -> Option<(TemplateKind, String)> {
        let normalized = normalize_watch_path(path);
        self.registrations
            .iter()
            .find(|(source, _, _)| *source == normalized)
            .map(|(_, kind, template)| (*kind, template.clone()))
    }

    fn is_relevant(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Name(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Create(_)
                | EventKind::Remove(_)
        )
    }
}

fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    match fs::canonicalize(&absolute) {
        Ok(canonical) => canonical,
        Err(_) => {
            if let Some(parent) = absolute.parent() {
                if let Ok(parent_canon) = fs::canonicalize(parent) {
                    if let Some(name) = absolute.file_name() {
                        return parent_canon.join(name);
                    }
                    return parent_canon;
                }
            }
            absolute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn re_registering_the_same_source_is_a_no_op() {
        let mut script = NamedTempFile::new().expect("temp script");
        write!(script, "-- ball").expect("write script");
        let mut watcher = ScriptWatcher::new().expect("watcher");
        watcher
            .watch_template(script.path(), TemplateKind::Ball, "basic")
            .expect("first registration");
        watcher
            .watch_template(script.path(), TemplateKind::Ball, "basic")
            .expect("second registration");
        assert_eq!(watcher.registrations.len(), 1, "duplicate registration should be ignored");
    }

    #[test]
    fn drained_changes_map_back_to_their_template() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("basic.lua");
        fs::write(&path, "-- ball").expect("write script");
        let mut watcher = ScriptWatcher::new().expect("watcher");
        watcher
            .watch_template(&path, TemplateKind::Ball, "basic")
            .expect("registration");

        fs::write(&path, "-- ball, edited").expect("rewrite script");

        // Delivery is asynchronous; poll until the event lands.
        let mut changes = Vec::new();
        for _ in 0..50 {
            changes = watcher.drain_changes();
            if !changes.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        let change = changes.first().expect("the edit should surface as a change");
        assert_eq!(change.kind, TemplateKind::Ball);
        assert_eq!(change.template, "basic");
        assert_eq!(change.path, normalize_watch_path(&path));
    }

    #[test]
    fn missing_source_is_rejected() {
        let mut watcher = ScriptWatcher::new().expect("watcher");
        let err = watcher
            .watch_template("does/not/exist.lua", TemplateKind::Block, "ramp")
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"), "error should name the missing path");
    }
}
