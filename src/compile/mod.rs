//! Turns module source text into an on-disk artifact plus a parsed script.

pub mod artifact;
pub mod cache;
pub mod declarations;
pub mod libraries;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rhai::{ParseError, AST};
use uuid::Uuid;

pub use artifact::{ArtifactImage, CompiledArtifact};
pub use cache::ArtifactCache;
pub use declarations::SourceKind;
pub use libraries::Library;

use crate::error::ScriptError;
use crate::module_api::{self, EngineOptions};

const FILE_PREFIX: &str = "minimodule";
const ARTIFACT_EXTENSION: &str = "artifact";
const SOURCE_EXTENSION: &str = "rhai";
const MAX_DIAGNOSTICS: usize = 5;
const ARTIFACT_SUFFIX_RANGE: u32 = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A compiler message. Lines and columns count from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub severity: Severity,
    pub text: String,
}

impl Diagnostic {
    fn error(line: usize, column: usize, text: impl Into<String>) -> Self {
        Self { line, column, severity: Severity::Error, text: text.into() }
    }

    fn warning(line: usize, column: usize, text: impl Into<String>) -> Self {
        Self { line, column, severity: Severity::Warning, text: text.into() }
    }

    fn from_parse(err: &ParseError) -> Self {
        let line = err.1.line().unwrap_or(1).saturating_sub(1);
        let column = err.1.position().unwrap_or(1).saturating_sub(1);
        Self::error(line, column, err.0.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
        };
        write!(f, "Line ({},{}): {severity}: {}", self.line, self.column, self.text)
    }
}

pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics.iter().take(MAX_DIAGNOSTICS).map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

/// Compiles module source for one region. Inline modules share artifacts through the cache;
/// external modules get a private artifact in their boundary's directory.
pub struct Compiler {
    root: PathBuf,
    region_id: Uuid,
    cache: Arc<ArtifactCache>,
}

impl Compiler {
    pub fn new(root: impl Into<PathBuf>, region_id: Uuid, cache: Arc<ArtifactCache>) -> Self {
        Self { root: root.into(), region_id, cache }
    }

    pub fn region_dir(&self) -> PathBuf {
        self.root.join(self.region_id.to_string())
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn compile(&self, script: Uuid, name: &str, source: &str) -> Result<Arc<CompiledArtifact>, ScriptError> {
        if let Some(artifact) = self.cache.acquire(source, script) {
            tracing::debug!("[mrm] {name}: reusing '{}'", artifact.path().display());
            return Ok(artifact);
        }
        let entry_type = declarations::entry_type(source)?;
        let fresh = Arc::new(self.build(script, name, source, &self.region_dir(), entry_type)?);
        let adopted = self.cache.insert(source, script, fresh.clone());
        if !Arc::ptr_eq(&adopted, &fresh) {
            tracing::debug!("[mrm] {name}: identical source compiled concurrently, adopting shared artifact");
            fresh.remove_files();
        }
        Ok(adopted)
    }

    /// Compiles outside the cache into `dir`, with the entry type chosen by the caller.
    pub fn compile_private(
        &self,
        script: Uuid,
        name: &str,
        source: &str,
        dir: &Path,
        entry_type: &str,
    ) -> Result<CompiledArtifact, ScriptError> {
        self.build(script, name, source, dir, entry_type.to_string())
    }

    /// Drops a script's claim on the artifact compiled from `source`.
    pub fn release(&self, source: &str, script: Uuid) -> bool {
        self.cache.release(source, script)
    }

    fn build(
        &self,
        script: Uuid,
        name: &str,
        source: &str,
        dir: &Path,
        entry_type: String,
    ) -> Result<CompiledArtifact, ScriptError> {
        let path = allocate_path(dir, script)?;
        evict_stale(&path)?;
        let source_path = write_source(&path, source)?;

        let (libraries, ast) = match check(name, source, &entry_type) {
            Ok(checked) => checked,
            Err(diagnostics) => {
                artifact::remove_files(&path, &source_path);
                return Err(ScriptError::Compilation { diagnostics: format_diagnostics(&diagnostics) });
            }
        };

        let digest = blake3::hash(source.as_bytes());
        let image = ArtifactImage {
            format: artifact::IMAGE_FORMAT,
            entry_type: entry_type.clone(),
            libraries: libraries.clone(),
            digest: digest.to_hex().to_string(),
            source: source.to_string(),
        };
        artifact::write_image(&path, &image)?;
        let (bytes, _) = artifact::read_image(&path)?;
        artifact::write_mirror(&path, &bytes)?;

        tracing::debug!("[mrm] {name}: compiled {entry_type} to '{}'", path.display());
        Ok(CompiledArtifact::new(path, source_path, entry_type, libraries, digest, ast))
    }
}

fn allocate_path(dir: &Path, script: Uuid) -> Result<PathBuf, ScriptError> {
    fs::create_dir_all(dir).map_err(|err| ScriptError::artifact_io(dir, err))?;
    let suffix = rand::thread_rng().gen_range(0..ARTIFACT_SUFFIX_RANGE);
    Ok(dir.join(format!("{FILE_PREFIX}_compiled_{script}_{suffix}.{ARTIFACT_EXTENSION}")))
}

fn evict_stale(path: &Path) -> Result<(), ScriptError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ScriptError::artifact_io(
            path,
            format!("unable to delete old existing artifact before writing new, compile aborted: {err}"),
        )),
    }
}

fn write_source(artifact: &Path, source: &str) -> Result<PathBuf, ScriptError> {
    let stem = artifact.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default();
    let path = artifact.with_file_name(format!("{FILE_PREFIX}_source_{stem}.{SOURCE_EXTENSION}"));
    fs::write(&path, source).map_err(|err| ScriptError::artifact_io(&path, err))?;
    Ok(path)
}

/// Resolves dependencies, parses, and checks the entry points. Warnings are logged; any error
/// fails the whole check.
fn check(name: &str, source: &str, entry_type: &str) -> Result<(Vec<Library>, AST), Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let mut dependencies = Vec::new();
    for (index, raw) in declarations::dependencies(source) {
        match Library::parse(raw) {
            Some(library) => dependencies.push(library),
            None => diagnostics.push(Diagnostic::error(index, 0, format!("unknown library '{raw}'"))),
        }
    }
    let libraries = libraries::reference_set(&dependencies);

    let engine = module_api::build_engine(EngineOptions { script: name, libraries: &libraries, policy: None, abort: None });
    let ast = match engine.compile(source) {
        Ok(ast) => Some(ast),
        Err(err) => {
            diagnostics.push(Diagnostic::from_parse(&err));
            None
        }
    };

    if let Some(ast) = &ast {
        let defines = |function: &str, arity: usize| {
            ast.iter_functions().any(|f| f.name == function && f.params.len() == arity)
        };
        if !defines("start", 1) {
            diagnostics.push(Diagnostic::error(0, 0, format!("{entry_type} does not define start(args)")));
        }
        if !defines("stop", 0) {
            diagnostics.push(Diagnostic::warning(0, 0, format!("{entry_type} does not define stop()")));
        }
    }

    diagnostics.truncate(MAX_DIAGNOSTICS);
    let failed = diagnostics.iter().any(|d| d.severity == Severity::Error);
    match ast {
        Some(ast) if !failed => {
            for warning in &diagnostics {
                tracing::warn!("[mrm] {name}: {warning}");
            }
            Ok((libraries, ast))
        }
        _ => Err(diagnostics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GREETER: &str = "//MRM:rhai\n//@DEPENDS:math\n//@namespace demo\n//@module Greeter : MiniModule\n\
fn Greeter() { #{ greeted: 0 } }\nfn start(args) { this.greeted += 1; }\nfn stop() { }\n";

    fn compiler(root: &Path) -> Compiler {
        Compiler::new(root, Uuid::new_v4(), Arc::new(ArtifactCache::new()))
    }

    #[test]
    fn compiles_and_writes_all_files() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let script = Uuid::new_v4();
        let artifact = compiler.compile(script, "Greeter", GREETER).expect("compiles");

        assert_eq!(artifact.entry_type(), "demo.Greeter");
        assert_eq!(artifact.libraries(), &[Library::Core, Library::Minimods, Library::Math]);
        assert!(artifact.path().starts_with(compiler.region_dir()));
        let file_name = artifact.path().file_name().and_then(|n| n.to_str()).expect("utf8 name");
        assert!(file_name.starts_with(&format!("minimodule_compiled_{script}_")));
        assert!(artifact.is_on_disk());
        assert!(artifact.mirror_path().is_file());
        assert_eq!(fs::read_to_string(artifact.source_path()).expect("source copy"), GREETER);
        assert_eq!(artifact.digest(), blake3::hash(GREETER.as_bytes()));
    }

    #[test]
    fn identical_source_is_compiled_once() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let first = compiler.compile(Uuid::new_v4(), "a", GREETER).expect("first");
        let second = compiler.compile(Uuid::new_v4(), "b", GREETER).expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.cache().len(), 1);
        let files = fs::read_dir(compiler.region_dir()).expect("region dir").count();
        assert_eq!(files, 3, "one artifact, one source copy, one mirror");
    }

    #[test]
    fn syntax_errors_are_reported_with_zero_based_positions() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let source = "//MRM:rhai\n//@module Broken : MiniModule\nfn start(args) { let x = ; }\n";
        let err = compiler.compile(Uuid::new_v4(), "Broken", source).expect_err("syntax error");
        let ScriptError::Compilation { diagnostics } = err else { panic!("unexpected error {err:?}") };
        assert!(diagnostics.starts_with("Line (2,"), "{diagnostics}");
        assert!(diagnostics.contains(": Error: "), "{diagnostics}");
        assert!(compiler.cache().is_empty());
        assert_eq!(fs::read_dir(compiler.region_dir()).expect("region dir").count(), 0);
    }

    #[test]
    fn missing_start_is_an_error_and_missing_stop_a_warning() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let no_start = "//MRM:rhai\n//@module Idle : MiniModule\nfn stop() {}\n";
        let err = compiler.compile(Uuid::new_v4(), "Idle", no_start).expect_err("start required");
        assert!(err.to_string().contains("Idle does not define start(args)"), "{err}");

        let no_stop = "//MRM:rhai\n//@module Runner : MiniModule\nfn start(args) {}\n";
        compiler.compile(Uuid::new_v4(), "Runner", no_stop).expect("stop is optional");
    }

    #[test]
    fn unknown_dependency_and_missing_entry_fail() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let unknown = "//MRM:rhai\n//@DEPENDS:System.Net\n//@module A : MiniModule\nfn start(args) {}\n";
        let err = compiler.compile(Uuid::new_v4(), "A", unknown).expect_err("unknown library");
        assert!(err.to_string().contains("Line (1,0): Error: unknown library 'System.Net'"), "{err}");

        let err = compiler.compile(Uuid::new_v4(), "B", "//MRM:rhai\nfn start(args) {}\n").expect_err("no entry");
        assert_eq!(err, ScriptError::Configuration(crate::error::ConfigurationError::NoEntryType));
    }

    #[test]
    fn diagnostics_are_capped() {
        let many: Vec<Diagnostic> = (0..8).map(|line| Diagnostic::error(line, 0, "bad")).collect();
        assert_eq!(format_diagnostics(&many).lines().count(), 5);
        assert_eq!(Diagnostic::warning(3, 4, "careful").to_string(), "Line (3,4): Warning: careful");
    }

    #[test]
    fn private_compiles_bypass_the_cache() {
        let dir = tempdir().expect("temp dir");
        let compiler = compiler(dir.path());
        let private_dir = dir.path().join("boundary");
        let artifact = compiler
            .compile_private(Uuid::new_v4(), "ext", GREETER, &private_dir, "Greeter")
            .expect("compiles privately");
        assert!(artifact.path().starts_with(&private_dir));
        assert_eq!(artifact.entry_type(), "Greeter");
        assert!(compiler.cache().is_empty());
    }
}
