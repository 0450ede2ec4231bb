use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::artifact::CompiledArtifact;

struct CacheEntry {
    artifact: Arc<CompiledArtifact>,
    dependents: HashSet<Uuid>,
}

/// Compiled artifacts keyed by the exact source text they came from. An entry lives exactly as
/// long as some script depends on it.
#[derive(Default)]
pub struct ArtifactCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `script` as a dependent of the artifact compiled from `source`, if there is one.
    pub fn acquire(&self, source: &str, script: Uuid) -> Option<Arc<CompiledArtifact>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(source)?;
        entry.dependents.insert(script);
        Some(entry.artifact.clone())
    }

    /// Registers a fresh compilation. When another script got the same source in first, its
    /// artifact is kept and returned and the caller's copy should be discarded.
    pub fn insert(&self, source: &str, script: Uuid, artifact: Arc<CompiledArtifact>) -> Arc<CompiledArtifact> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(source.to_string())
            .or_insert_with(|| CacheEntry { artifact, dependents: HashSet::new() });
        entry.dependents.insert(script);
        entry.artifact.clone()
    }

    /// Drops `script`'s dependency. The last dependent evicts the entry and deletes its files.
    pub fn release(&self, source: &str, script: Uuid) -> bool {
        let evicted = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(source) else { return false };
            if !entry.dependents.remove(&script) {
                return false;
            }
            if entry.dependents.is_empty() {
                entries.remove(source)
            } else {
                None
            }
        };
        if let Some(entry) = evicted {
            tracing::debug!("[mrm] evicting artifact '{}'", entry.artifact.path().display());
            entry.artifact.remove_files();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.entries.read().contains_key(source)
    }

    pub fn dependents(&self, source: &str) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> =
            self.entries.read().get(source).map(|entry| entry.dependents.iter().copied().collect()).unwrap_or_default();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use crate::compile::libraries::Library;
    use tempfile::tempdir;

    fn artifact(dir: &std::path::Path, name: &str) -> Arc<CompiledArtifact> {
        let path: PathBuf = dir.join(format!("{name}.artifact"));
        let source = dir.join(format!("{name}.rhai"));
        fs::write(&path, b"image").expect("write artifact");
        fs::write(&source, b"source").expect("write source");
        Arc::new(CompiledArtifact::new(
            path,
            source,
            "Demo".into(),
            Library::BASELINE.to_vec(),
            blake3::hash(name.as_bytes()),
            rhai::AST::empty(),
        ))
    }

    #[test]
    fn shared_until_last_dependent_releases() {
        let dir = tempdir().expect("temp dir");
        let cache = ArtifactCache::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = artifact(dir.path(), "one");
        cache.insert("text", a, first.clone());
        let shared = cache.acquire("text", b).expect("cache hit");
        assert!(Arc::ptr_eq(&first, &shared));
        assert_eq!(cache.dependents("text").len(), 2);

        assert!(cache.release("text", a));
        assert!(cache.contains("text"));
        assert!(first.path().exists());
        assert!(cache.release("text", b));
        assert!(!cache.contains("text"));
        assert!(!first.path().exists(), "evicted artifact is deleted");
        assert!(!first.source_path().exists());
    }

    #[test]
    fn racing_insert_adopts_existing_entry() {
        let dir = tempdir().expect("temp dir");
        let cache = ArtifactCache::new();
        let winner = artifact(dir.path(), "winner");
        let loser = artifact(dir.path(), "loser");
        cache.insert("text", Uuid::new_v4(), winner.clone());
        let adopted = cache.insert("text", Uuid::new_v4(), loser);
        assert!(Arc::ptr_eq(&adopted, &winner));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn releasing_unknown_dependency_is_a_no_op() {
        let cache = ArtifactCache::new();
        assert!(cache.acquire("missing", Uuid::new_v4()).is_none());
        assert!(!cache.release("missing", Uuid::new_v4()));
        assert!(cache.is_empty());
    }
}
