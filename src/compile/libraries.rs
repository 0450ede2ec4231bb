use std::fmt;

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, BasicTimePackage, CorePackage, LogicPackage,
    MoreStringPackage, Package, StandardPackage,
};
use rhai::Engine;
use serde::{Deserialize, Serialize};

use crate::module_api;

/// A library a module can reference with `//@DEPENDS:<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Library {
    Core,
    Minimods,
    Math,
    String,
    Array,
    Map,
    Time,
    Logic,
    Standard,
}

impl Library {
    /// Every module references these.
    pub const BASELINE: [Library; 2] = [Library::Core, Library::Minimods];

    pub const ALL: [Library; 9] = [
        Library::Core,
        Library::Minimods,
        Library::Math,
        Library::String,
        Library::Array,
        Library::Map,
        Library::Time,
        Library::Logic,
        Library::Standard,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Library::Core => "core",
            Library::Minimods => "minimods",
            Library::Math => "math",
            Library::String => "string",
            Library::Array => "array",
            Library::Map => "map",
            Library::Time => "time",
            Library::Logic => "logic",
            Library::Standard => "standard",
        }
    }

    /// Resolves a dependency name. Case and a trailing `.rhai` are ignored.
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        let trimmed = trimmed.strip_suffix(".rhai").unwrap_or(trimmed);
        Self::ALL.into_iter().find(|library| library.name().eq_ignore_ascii_case(trimmed))
    }

    pub fn install(self, engine: &mut Engine) {
        match self {
            Library::Core => {
                engine.register_global_module(CorePackage::new().as_shared_module());
            }
            Library::Minimods => module_api::register_api(engine),
            Library::Math => {
                engine.register_global_module(BasicMathPackage::new().as_shared_module());
            }
            Library::String => {
                engine.register_global_module(MoreStringPackage::new().as_shared_module());
            }
            Library::Array => {
                engine.register_global_module(BasicArrayPackage::new().as_shared_module());
            }
            Library::Map => {
                engine.register_global_module(BasicMapPackage::new().as_shared_module());
            }
            Library::Time => {
                engine.register_global_module(BasicTimePackage::new().as_shared_module());
            }
            Library::Logic => {
                engine.register_global_module(LogicPackage::new().as_shared_module());
            }
            Library::Standard => {
                engine.register_global_module(StandardPackage::new().as_shared_module());
            }
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Baseline first, then each dependency once, in the order declared.
pub fn reference_set(dependencies: &[Library]) -> Vec<Library> {
    let mut libraries = Library::BASELINE.to_vec();
    for library in dependencies {
        if !libraries.contains(library) {
            libraries.push(*library);
        }
    }
    libraries
}
