//! Comment directives carried by module source.

use crate::error::ConfigurationError;

pub const MODULE_MARKER: &str = "//MRM:rhai";
pub const EXTERNAL_MARKER: &str = "//MRM:X";
pub const MODULE_BASE_TYPE: &str = "MiniModule";
pub const DEPENDS_PREFIX: &str = "//@DEPENDS:";
const NAMESPACE_PREFIX: &str = "//@namespace";
const MODULE_PREFIX: &str = "//@module";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Inline,
    External,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Inline => "MRM",
            SourceKind::External => "XMRM",
        }
    }
}

/// Classifies source by its first line. Anything without a marker is not a module.
pub fn source_kind(text: &str) -> Option<SourceKind> {
    let first = text.lines().next()?.trim();
    if first.starts_with(MODULE_MARKER) {
        Some(SourceKind::Inline)
    } else if first.starts_with(EXTERNAL_MARKER) {
        Some(SourceKind::External)
    } else {
        None
    }
}

/// Finds the entry type. The first `//@module Type : MiniModule` wins and is qualified by
/// the namespace in force at that line.
pub fn entry_type(text: &str) -> Result<String, ConfigurationError> {
    let mut namespace: Option<String> = None;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if let Some(rest) = directive(line, NAMESPACE_PREFIX) {
            let name = rest.trim_end_matches('{').trim();
            if name.is_empty() {
                return Err(ConfigurationError::AmbiguousNamespace { line: index + 1 });
            }
            namespace = Some(name.to_string());
        } else if let Some(rest) = directive(line, MODULE_PREFIX) {
            let Some((name, base)) = rest.split_once(':') else { continue };
            let name = name.trim();
            if base.trim() != MODULE_BASE_TYPE || !is_identifier(name) {
                continue;
            }
            return Ok(match &namespace {
                Some(ns) => format!("{ns}.{name}"),
                None => name.to_string(),
            });
        }
    }
    Err(ConfigurationError::NoEntryType)
}

/// A `//@module` declaration, qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredType {
    pub name: String,
    pub base: String,
}

/// Every well-formed `//@module` declaration, whatever its base type.
pub fn declared_types(text: &str) -> Vec<DeclaredType> {
    let mut namespace: Option<&str> = None;
    let mut types = Vec::new();
    for line in text.lines().map(str::trim) {
        if let Some(rest) = directive(line, NAMESPACE_PREFIX) {
            let name = rest.trim_end_matches('{').trim();
            namespace = (!name.is_empty()).then_some(name);
        } else if let Some(rest) = directive(line, MODULE_PREFIX) {
            let Some((name, base)) = rest.split_once(':') else { continue };
            let name = name.trim();
            if !is_identifier(name) {
                continue;
            }
            let name = match namespace {
                Some(ns) => format!("{ns}.{name}"),
                None => name.to_string(),
            };
            types.push(DeclaredType { name, base: base.trim().to_string() });
        }
    }
    types
}

/// Raw names from every non-empty `//@DEPENDS:` line, with zero-based line indexes.
pub fn dependencies(text: &str) -> Vec<(usize, &str)> {
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| Some((index, line.trim().strip_prefix(DEPENDS_PREFIX)?.trim())))
        .filter(|(_, name)| !name.is_empty())
        .collect()
}

fn directive<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
