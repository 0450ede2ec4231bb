use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::script::Script;

pub type ScriptRegistry = Registry<Script>;

struct Index<T> {
    by_id: HashMap<Uuid, (String, Arc<T>)>,
    by_name: HashMap<String, Uuid>,
}

impl<T> Default for Index<T> {
    fn default() -> Self {
        Self { by_id: HashMap::new(), by_name: HashMap::new() }
    }
}

/// Live entries indexed by identity and by unique display name.
pub struct Registry<T> {
    index: RwLock<Index<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { index: RwLock::new(Index::default()) }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `id` and returns the name it was given. An id that is already
    /// registered keeps its entry and name.
    pub fn add(&self, id: Uuid, base_name: &str, value: Arc<T>) -> String {
        let mut index = self.index.write();
        if let Some((name, _)) = index.by_id.get(&id) {
            return name.clone();
        }
        let name = next_free_name(base_name, |candidate| index.by_name.contains_key(candidate));
        index.by_name.insert(name.clone(), id);
        index.by_id.insert(id, (name.clone(), value));
        name
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<T>> {
        let mut index = self.index.write();
        let (name, value) = index.by_id.remove(&id)?;
        index.by_name.remove(&name);
        Some(value)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<T>> {
        self.index.read().by_id.get(&id).map(|(_, value)| value.clone())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<T>> {
        let index = self.index.read();
        let id = index.by_name.get(name)?;
        index.by_id.get(id).map(|(_, value)| value.clone())
    }

    pub fn name_of(&self, id: Uuid) -> Option<String> {
        self.index.read().by_id.get(&id).map(|(name, _)| name.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.read().by_id.contains_key(&id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.index.read().by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().by_id.is_empty()
    }

    /// Every entry, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, Arc<T>)> {
        let index = self.index.read();
        let mut entries: Vec<(String, Arc<T>)> =
            index.by_id.values().map(|(name, value)| (name.clone(), value.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn names(&self) -> HashSet<String> {
        self.index.read().by_name.keys().cloned().collect()
    }
}

/// `base` when free, otherwise `base_<n>` for the lowest `n >= 1` not taken.
pub fn next_free_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1u64..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| format!("{base}_{}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collisions_take_the_lowest_free_suffix() {
        let registry: Registry<&str> = Registry::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(registry.add(a, "Owner.Box.Script", Arc::new("a")), "Owner.Box.Script");
        assert_eq!(registry.add(b, "Owner.Box.Script", Arc::new("b")), "Owner.Box.Script_1");
        assert_eq!(registry.add(c, "Owner.Box.Script", Arc::new("c")), "Owner.Box.Script_2");

        registry.remove(b);
        let d = Uuid::new_v4();
        assert_eq!(registry.add(d, "Owner.Box.Script", Arc::new("d")), "Owner.Box.Script_1");

        registry.remove(a);
        let e = Uuid::new_v4();
        assert_eq!(registry.add(e, "Owner.Box.Script", Arc::new("e")), "Owner.Box.Script");
    }

    #[test]
    fn both_indexes_stay_in_step() {
        let registry: Registry<&str> = Registry::new();
        let id = Uuid::new_v4();
        registry.add(id, "Name", Arc::new("value"));
        assert_eq!(registry.add(id, "Other", Arc::new("again")), "Name", "one entry per identity");
        assert_eq!(registry.by_name("Name").map(|v| *v), Some("value"));
        assert_eq!(registry.name_of(id).as_deref(), Some("Name"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id).is_some());
        assert!(!registry.contains(id));
        assert!(!registry.contains_name("Name"));
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let registry: Registry<u8> = Registry::new();
        registry.add(Uuid::new_v4(), "b", Arc::new(2));
        registry.add(Uuid::new_v4(), "a", Arc::new(1));
        registry.add(Uuid::new_v4(), "a", Arc::new(3));
        let names: Vec<String> = registry.snapshot().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "a_1", "b"]);
    }

    #[test]
    fn next_free_name_skips_taken_suffixes() {
        let taken = ["x", "x_1", "x_3"];
        assert_eq!(next_free_name("x", |name| taken.contains(&name)), "x_2");
        assert_eq!(next_free_name("y", |name| taken.contains(&name)), "y");
    }
}
