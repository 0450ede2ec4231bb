//! Feeds `*.rhai` files from a directory to an engine as source items on one host object.

use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Receiver};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use uuid::Uuid;

use crate::engine::ScriptEngine;
use crate::region::ObjectId;

const SOURCE_EXTENSION: &str = "rhai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceChangeKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    pub path: PathBuf,
    pub item: Uuid,
    pub kind: SourceChangeKind,
}

/// Item id for a watched file: stable across runs for the same canonical path.
pub fn item_id(path: &Path) -> Uuid {
    let normalized = normalize_watch_path(path);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, normalized.to_string_lossy().as_bytes())
}

/// Inventory-style item name for a watched file.
pub fn item_name(path: &Path) -> String {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_else(|| "module".to_string())
}

fn is_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(SOURCE_EXTENSION))
}

pub struct SourceWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    root: Option<PathBuf>,
    host_object: ObjectId,
}

impl SourceWatcher {
    pub fn new(host_object: ObjectId) -> Result<Self> {
        let (tx, rx) = unbounded::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure module source watcher")?;
        Ok(Self { watcher, rx, root: None, host_object })
    }

    pub fn host_object(&self) -> ObjectId {
        self.host_object
    }

    /// Starts watching `root` and returns the module files already in it.
    pub fn watch_dir(&mut self, root: impl AsRef<Path>) -> Result<Vec<SourceChange>> {
        let root = root.as_ref();
        if !root.is_dir() {
            anyhow::bail!("path '{}' is not a directory", root.display());
        }
        let normalized = normalize_watch_path(root);
        self.watcher
            .watch(&normalized, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", normalized.display()))?;
        let mut existing = Vec::new();
        scan(&normalized, &mut existing).with_context(|| format!("scan {}", normalized.display()))?;
        existing.sort();
        self.root = Some(normalized);
        Ok(existing
            .into_iter()
            .map(|path| SourceChange { item: item_id(&path), path, kind: SourceChangeKind::Changed })
            .collect())
    }

    pub fn drain_changes(&mut self) -> Vec<SourceChange> {
        let mut changes: Vec<SourceChange> = Vec::new();
        let mut backlog: VecDeque<notify::Result<Event>> = VecDeque::new();
        while let Ok(event) = self.rx.try_recv() {
            backlog.push_back(event);
        }
        while let Some(event) = backlog.pop_front() {
            match event {
                Ok(event) => {
                    let Some(kind) = change_kind(&event.kind) else { continue };
                    for path in event.paths {
                        if !is_source(&path) || !self.is_watched(&path) {
                            continue;
                        }
                        let kind = if kind == SourceChangeKind::Changed && !path.exists() {
                            SourceChangeKind::Removed
                        } else {
                            kind
                        };
                        let change = SourceChange { item: item_id(&path), path, kind };
                        if changes.last() != Some(&change) {
                            changes.push(change);
                        }
                    }
                }
                Err(err) => tracing::warn!("[mrm] source watcher error: {err}"),
            }
        }
        changes
    }

    /// Hands each change to the engine as a rez or removal of the matching item.
    pub fn apply(&self, engine: &ScriptEngine, changes: &[SourceChange]) -> usize {
        let mut applied = 0;
        for change in changes {
            match change.kind {
                SourceChangeKind::Changed => match fs::read_to_string(&change.path) {
                    Ok(text) => {
                        if engine.on_script_rez(self.host_object, change.item, &item_name(&change.path), &text).is_some()
                        {
                            applied += 1;
                        }
                    }
                    Err(err) => tracing::warn!("[mrm] unable to read '{}': {err}", change.path.display()),
                },
                SourceChangeKind::Removed => {
                    if engine.on_remove_script(change.item) {
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    fn is_watched(&self, path: &Path) -> bool {
        let normalized = normalize_watch_path(path);
        self.root.as_ref().is_some_and(|root| normalized.starts_with(root))
    }
}

fn scan(dir: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            scan(&path, found)?;
        } else if is_source(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn change_kind(kind: &EventKind) -> Option<SourceChangeKind> {
    match kind {
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Create(_) => Some(SourceChangeKind::Changed),
        EventKind::Remove(_) => Some(SourceChangeKind::Removed),
        _ => None,
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
        Err(_) => match (absolute.parent().and_then(|parent| fs::canonicalize(parent).ok()), absolute.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            (Some(parent), None) => parent,
            _ => absolute,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ids_are_stable_per_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("greeter.rhai");
        fs::write(&path, "//MRM:rhai\n").expect("write module");
        assert_eq!(item_id(&path), item_id(&path));
        assert_ne!(item_id(&path), item_id(&dir.path().join("other.rhai")));
        assert_eq!(item_name(&path), "greeter");
    }

    #[test]
    fn removed_files_keep_their_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gone.rhai");
        fs::write(&path, "//MRM:rhai\n").expect("write module");
        let before = item_id(&path);
        fs::remove_file(&path).expect("remove module");
        assert_eq!(item_id(&path), before);
    }

    #[test]
    fn watch_dir_lists_existing_modules() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("a.rhai"), "//MRM:rhai\n").expect("write a");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write notes");
        fs::create_dir(dir.path().join("nested")).expect("nested dir");
        fs::write(dir.path().join("nested").join("b.rhai"), "//MRM:rhai\n").expect("write b");

        let mut watcher = SourceWatcher::new(Uuid::new_v4()).expect("watcher");
        let existing = watcher.watch_dir(dir.path()).expect("watch dir");
        let names: Vec<String> = existing.iter().map(|change| item_name(&change.path)).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(existing.iter().all(|change| change.kind == SourceChangeKind::Changed));
    }
}
