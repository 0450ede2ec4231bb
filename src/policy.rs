use bitflags::bitflags;
use rhai::Engine;

bitflags! {
    /// Host facilities a trust policy lets a module reach.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Grants: u32 {
        const OBJECTS = 1 << 0;
        const CHAT = 1 << 1;
        const TERRAIN = 1 << 2;
        const PERSISTENCE = 1 << 3;
        const GRAPHICS = 1 << 4;
        const MICROTHREADS = 1 << 5;
    }
}

impl Grants {
    pub fn label(self) -> &'static str {
        if self == Grants::OBJECTS {
            "objects"
        } else if self == Grants::CHAT {
            "chat"
        } else if self == Grants::TERRAIN {
            "terrain"
        } else if self == Grants::PERSISTENCE {
            "persistence"
        } else if self == Grants::GRAPHICS {
            "graphics"
        } else if self == Grants::MICROTHREADS {
            "microthreads"
        } else {
            "capabilities"
        }
    }
}

/// Execution limits plus the grants of a named security level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    pub name: String,
    pub grants: Grants,
    /// Operations allowed per module call, 0 = unlimited.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl TrustPolicy {
    /// Looks a level up by name (case-insensitive). Unknown names yield an empty policy.
    pub fn named(name: &str) -> Self {
        let key = name.trim().to_ascii_lowercase();
        match key.as_str() {
            "nothing" => Self::limited(&key, Grants::empty(), 10_000, 8),
            "execution" => Self::limited(&key, Grants::MICROTHREADS, 100_000, 16),
            "internet" => Self::limited(&key, Grants::OBJECTS | Grants::CHAT | Grants::MICROTHREADS, 500_000, 32),
            "localintranet" => Self::limited(
                &key,
                Grants::OBJECTS | Grants::CHAT | Grants::MICROTHREADS | Grants::PERSISTENCE | Grants::GRAPHICS,
                1_000_000,
                48,
            ),
            "everything" => Self::limited(&key, Grants::all(), 5_000_000, 64),
            "fulltrust" | "skipverification" => Self::full_trust(),
            _ => {
                tracing::warn!("[mrm] unknown trust policy '{name}', modules will run with no permissions");
                Self::limited(&key, Grants::empty(), 10_000, 8)
            }
        }
    }

    pub fn full_trust() -> Self {
        Self {
            name: "fulltrust".to_string(),
            grants: Grants::all(),
            max_operations: 0,
            max_call_levels: 64,
            max_string_size: 0,
            max_array_size: 0,
            max_map_size: 0,
        }
    }

    fn limited(name: &str, grants: Grants, max_operations: u64, max_call_levels: usize) -> Self {
        Self {
            name: name.to_string(),
            grants,
            max_operations,
            max_call_levels,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }

    pub fn allows(&self, grant: Grants) -> bool {
        self.grants.contains(grant)
    }

    pub fn apply_limits(&self, engine: &mut Engine) {
        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let policy = TrustPolicy::named("Internet");
        assert_eq!(policy.name, "internet");
        assert!(policy.allows(Grants::OBJECTS));
        assert!(!policy.allows(Grants::TERRAIN));
    }

    #[test]
    fn unknown_policy_grants_nothing() {
        let policy = TrustPolicy::named("Sandbox-ish");
        assert!(policy.grants.is_empty());
        assert!(policy.max_operations > 0);
    }

    #[test]
    fn full_trust_is_unbounded() {
        let policy = TrustPolicy::named("FullTrust");
        assert_eq!(policy.grants, Grants::all());
        assert_eq!(policy.max_operations, 0);
    }
}
