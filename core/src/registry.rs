//! Identifier registry: permanent integer ids for runtime identities.
//!
//! Ids are grouped by category:
//!
//! ```text
//!   0        universal intermediate representation
//!  -1        unknown (returned for unresolvable names)
//!  100-119   interpreted
//!  120-139   compiled
//!  140-159   managed (VM / bytecode)
//!  160-179   domain-specific
//! ```
//!
//! The table is assembled once through [`RegistryBuilder`] and never changes
//! afterwards. An id is never reused, even when its runtime has no row in
//! the matrix any more.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Permanent integer identity of a runtime / language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(i32);

impl RuntimeId {
    pub const UNIVERSAL_IR: Self = Self(0);
    pub const UNKNOWN: Self = Self(-1);

    pub const PYTHON: Self = Self(100);
    pub const JAVASCRIPT: Self = Self(101);
    pub const TYPESCRIPT: Self = Self(102);
    pub const RUBY: Self = Self(103);
    pub const PHP: Self = Self(104);
    pub const LUA: Self = Self(105);
    pub const R: Self = Self(106);
    pub const BASH: Self = Self(107);
    pub const PERL: Self = Self(108);

    pub const GO: Self = Self(120);
    pub const RUST: Self = Self(121);
    pub const C: Self = Self(122);
    pub const CPP: Self = Self(123);

    pub const JAVA: Self = Self(140);
    pub const KOTLIN: Self = Self(141);
    pub const SCALA: Self = Self(142);
    pub const CSHARP: Self = Self(143);
    pub const SWIFT: Self = Self(144);

    pub const SQL: Self = Self(160);
    pub const HTML: Self = Self(161);
    pub const CSS: Self = Self(162);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeCategory {
    Intermediate,
    Interpreted,
    Compiled,
    Managed,
    DomainSpecific,
    Unknown,
}

impl RuntimeCategory {
    /// Category implied by the id range.
    pub fn for_id(id: RuntimeId) -> Self {
        match id.get() {
            0 => Self::Intermediate,
            100..=119 => Self::Interpreted,
            120..=139 => Self::Compiled,
            140..=159 => Self::Managed,
            160..=179 => Self::DomainSpecific,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEntry {
    pub name: String,
    pub id: RuntimeId,
    pub category: RuntimeCategory,
    pub aliases: Vec<String>,
}

const BUILTIN: &[(&str, RuntimeId, &[&str])] = &[
    ("universal_ir", RuntimeId::UNIVERSAL_IR, &["ir"]),
    ("python", RuntimeId::PYTHON, &["py"]),
    ("javascript", RuntimeId::JAVASCRIPT, &["js"]),
    ("typescript", RuntimeId::TYPESCRIPT, &["ts"]),
    ("ruby", RuntimeId::RUBY, &["rb"]),
    ("php", RuntimeId::PHP, &[]),
    ("lua", RuntimeId::LUA, &[]),
    ("r", RuntimeId::R, &[]),
    ("bash", RuntimeId::BASH, &["sh"]),
    ("perl", RuntimeId::PERL, &["pl"]),
    ("go", RuntimeId::GO, &["golang"]),
    ("rust", RuntimeId::RUST, &["rs"]),
    ("c", RuntimeId::C, &[]),
    ("cpp", RuntimeId::CPP, &["c++"]),
    ("java", RuntimeId::JAVA, &[]),
    ("kotlin", RuntimeId::KOTLIN, &["kt"]),
    ("scala", RuntimeId::SCALA, &[]),
    ("csharp", RuntimeId::CSHARP, &["c#", "cs"]),
    ("swift", RuntimeId::SWIFT, &[]),
    ("sql", RuntimeId::SQL, &[]),
    ("html", RuntimeId::HTML, &[]),
    ("css", RuntimeId::CSS, &[]),
];

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Immutable lookup table from names and ids to runtime entries.
#[derive(Debug, Clone)]
pub struct IdentifierRegistry {
    entries: BTreeMap<RuntimeId, RuntimeEntry>,
    by_name: HashMap<String, RuntimeId>,
}

impl IdentifierRegistry {
    /// The built-in table without any extra registrations.
    pub fn builtin() -> Self {
        RegistryBuilder::new().build()
    }

    /// Resolve a name or alias; unresolvable names map to [`RuntimeId::UNKNOWN`].
    pub fn resolve(&self, name: &str) -> RuntimeId {
        self.by_name
            .get(&normalize(name))
            .copied()
            .unwrap_or(RuntimeId::UNKNOWN)
    }

    pub fn lookup(&self, name: &str) -> Option<&RuntimeEntry> {
        self.by_name
            .get(&normalize(name))
            .and_then(|id| self.entries.get(id))
    }

    pub fn get(&self, id: RuntimeId) -> Option<&RuntimeEntry> {
        self.entries.get(&id)
    }

    pub fn name_of(&self, id: RuntimeId) -> &str {
        self.entries
            .get(&id)
            .map(|entry| entry.name.as_str())
            .unwrap_or("unknown")
    }

    pub fn contains(&self, id: RuntimeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Entries in ascending id order.
    pub fn entries(&self) -> impl Iterator<Item = &RuntimeEntry> {
        self.entries.values()
    }

    pub fn by_category(&self, category: RuntimeCategory) -> Vec<&RuntimeEntry> {
        self.entries
            .values()
            .filter(|entry| entry.category == category)
            .collect()
    }
}

impl Default for IdentifierRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Assembles a registry at process start. The built-in table is always
/// present; extra runtimes must not reuse an existing id or name.
#[derive(Debug)]
pub struct RegistryBuilder {
    registry: IdentifierRegistry,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let mut registry = IdentifierRegistry {
            entries: BTreeMap::new(),
            by_name: HashMap::new(),
        };
        for (name, id, aliases) in BUILTIN {
            registry.by_name.insert((*name).to_string(), *id);
            for alias in *aliases {
                registry.by_name.insert((*alias).to_string(), *id);
            }
            registry.entries.insert(
                *id,
                RuntimeEntry {
                    name: (*name).to_string(),
                    id: *id,
                    category: RuntimeCategory::for_id(*id),
                    aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
                },
            );
        }
        Self { registry }
    }

    pub fn register(&mut self, name: &str, id: RuntimeId) -> Result<&mut Self> {
        let key = normalize(name);
        if key.is_empty() {
            return Err(CoreError::RegistryConflict {
                message: "runtime name must not be empty".to_string(),
            });
        }
        if id == RuntimeId::UNKNOWN {
            return Err(CoreError::RegistryConflict {
                message: format!("id {id} is reserved for unknown runtimes"),
            });
        }
        if let Some(existing) = self.registry.entries.get(&id) {
            return Err(CoreError::RegistryConflict {
                message: format!("id {id} already assigned to {}", existing.name),
            });
        }
        if let Some(existing) = self.registry.by_name.get(&key) {
            return Err(CoreError::RegistryConflict {
                message: format!("name {key} already assigned to id {existing}"),
            });
        }
        self.registry.by_name.insert(key.clone(), id);
        self.registry.entries.insert(
            id,
            RuntimeEntry {
                name: key,
                id,
                category: RuntimeCategory::for_id(id),
                aliases: Vec::new(),
            },
        );
        Ok(self)
    }

    pub fn alias(&mut self, alias: &str, target: &str) -> Result<&mut Self> {
        let alias = normalize(alias);
        let target_id = self.registry.resolve(target);
        if target_id == RuntimeId::UNKNOWN {
            return Err(CoreError::RegistryConflict {
                message: format!("alias target {target} is not registered"),
            });
        }
        if let Some(existing) = self.registry.by_name.get(&alias) {
            return Err(CoreError::RegistryConflict {
                message: format!("name {alias} already assigned to id {existing}"),
            });
        }
        self.registry.by_name.insert(alias.clone(), target_id);
        if let Some(entry) = self.registry.entries.get_mut(&target_id) {
            entry.aliases.push(alias);
        }
        Ok(self)
    }

    pub fn build(self) -> IdentifierRegistry {
        self.registry
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_ids_and_names_unique() {
        let ids: HashSet<_> = BUILTIN.iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids.len(), BUILTIN.len());

        let mut names = HashSet::new();
        for (name, _, aliases) in BUILTIN {
            assert!(names.insert(*name), "duplicate name {name}");
            for alias in *aliases {
                assert!(names.insert(*alias), "duplicate alias {alias}");
            }
        }
    }

    #[test]
    fn test_resolve_names_and_aliases() {
        let registry = IdentifierRegistry::builtin();
        assert_eq!(registry.resolve("python"), RuntimeId::PYTHON);
        assert_eq!(registry.resolve("  Python "), RuntimeId::PYTHON);
        assert_eq!(registry.resolve("c++"), RuntimeId::CPP);
        assert_eq!(registry.resolve("C#"), RuntimeId::CSHARP);
        assert_eq!(registry.resolve("cobol"), RuntimeId::UNKNOWN);
        assert_eq!(registry.name_of(RuntimeId::RUST), "rust");
        assert_eq!(registry.name_of(RuntimeId::new(999)), "unknown");
    }

    #[test]
    fn test_categories_follow_ranges() {
        let registry = IdentifierRegistry::builtin();
        assert_eq!(
            registry.get(RuntimeId::GO).map(|e| e.category),
            Some(RuntimeCategory::Compiled)
        );
        assert_eq!(
            RuntimeCategory::for_id(RuntimeId::UNIVERSAL_IR),
            RuntimeCategory::Intermediate
        );
        assert_eq!(registry.by_category(RuntimeCategory::DomainSpecific).len(), 3);
    }

    #[test]
    fn test_builder_rejects_reused_id_and_name() {
        let mut builder = RegistryBuilder::new();
        let err = match builder.register("zig", RuntimeId::RUST) {
            Ok(_) => panic!("reused id must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::RegistryConflict);

        let err = match builder.register("Rust", RuntimeId::new(124)) {
            Ok(_) => panic!("reused name must be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::RegistryConflict);
    }

    #[test]
    fn test_builder_extends_table() {
        let mut builder = RegistryBuilder::new();
        assert!(builder.register("zig", RuntimeId::new(124)).is_ok());
        assert!(builder.alias("ziglang", "zig").is_ok());
        let registry = builder.build();

        assert_eq!(registry.resolve("ziglang"), RuntimeId::new(124));
        assert_eq!(
            registry.get(RuntimeId::new(124)).map(|e| e.category),
            Some(RuntimeCategory::Compiled)
        );
    }
}
