use std::path::PathBuf;
use std::time::Duration;

use rhai::EvalAltResult;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("source does not start with a recognized module marker")]
    MissingMarker,
    #[error("no public type declared as `: MiniModule` was found")]
    NoEntryType,
    #[error("namespace directive on line {line} has no name")]
    AmbiguousNamespace { line: usize },
    #[error("{0}")]
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("compilation failed:\n{diagnostics}")]
    Compilation { diagnostics: String },
    #[error("artifact i/o failed for '{}': {message}", path.display())]
    ArtifactIo { path: PathBuf, message: String },
    #[error("compiler reported success but '{}' was not written", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("{actor} is not allowed to {command} {script}")]
    Unauthorized { command: String, script: String, actor: String },
    #[error("{script} faulted: {detail}")]
    RuntimeFault { script: String, detail: String },
    #[error("{script} did not stop within {timeout:?}")]
    TimeoutOnStop { script: String, timeout: Duration },
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("{0} has no compiled module")]
    NotConfigured(String),
    #[error("{0} has been disposed")]
    Disposed(String),
    #[error("host object {1} of {0} no longer exists")]
    HostObjectMissing(String, Uuid),
}

impl ScriptError {
    pub fn artifact_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ScriptError::ArtifactIo { path: path.into(), message: err.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Insufficient permission for {principal} to edit {target}")]
    PermissionDenied { principal: String, target: String },
    #[error("trust policy '{policy}' does not grant {grant}")]
    NotGranted { policy: String, grant: String },
    #[error("boundary unreachable: handle '{0}' is no longer live")]
    BoundaryUnreachable(String),
    #[error("object {0} does not exist")]
    ObjectMissing(Uuid),
    #[error("{0}")]
    Region(String),
}

impl From<WorldError> for CapabilityError {
    fn from(err: WorldError) -> Self {
        CapabilityError::Region(err.to_string())
    }
}

impl From<CapabilityError> for Box<EvalAltResult> {
    fn from(err: CapabilityError) -> Self {
        err.to_string().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("object {0} not found")]
    ObjectNotFound(Uuid),
    #[error("asset {0} not found")]
    AssetNotFound(Uuid),
    #[error("terrain coordinate ({x}, {y}) out of range")]
    OutOfRange { x: i64, y: i64 },
    #[error("{0}")]
    Other(String),
}

/// Joins a Rhai error and every nested cause into one line-separated report.
pub fn flatten_eval_error(err: &EvalAltResult) -> String {
    let mut text = err.to_string();
    let mut current = err;
    loop {
        let inner = match current {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => inner.as_ref(),
            EvalAltResult::ErrorInModule(_, inner, _) => inner.as_ref(),
            _ => break,
        };
        text.push_str("\n\nInner failure: ");
        text.push_str(&inner.to_string());
        current = inner;
    }
    text
}

/// Same as [`flatten_eval_error`] for any `std::error::Error` chain.
pub fn flatten_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str("\n\nInner failure: ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Position;

    #[test]
    fn nested_function_errors_are_flattened() {
        let innermost: Box<EvalAltResult> = "divide by zero".into();
        let middle = EvalAltResult::ErrorInFunctionCall(
            "helper".into(),
            String::new(),
            innermost,
            Position::NONE,
        );
        let outer =
            EvalAltResult::ErrorInFunctionCall("start".into(), String::new(), Box::new(middle), Position::NONE);
        let text = flatten_eval_error(&outer);
        assert_eq!(text.matches("Inner failure: ").count(), 2);
        assert!(text.ends_with("divide by zero"), "innermost cause last: {text}");
    }

    #[test]
    fn capability_errors_become_runtime_errors() {
        let err: Box<EvalAltResult> =
            CapabilityError::BoundaryUnreachable("demo/world".into()).into();
        assert!(matches!(*err, EvalAltResult::ErrorRuntime(..)));
        assert!(err.to_string().contains("demo/world"));
    }

    #[test]
    fn script_errors_describe_the_actor() {
        let err = ScriptError::Unauthorized {
            command: "stop".into(),
            script: "Owner.Box.greeter".into(),
            actor: "Mallory Visitor".into(),
        };
        assert_eq!(err.to_string(), "Mallory Visitor is not allowed to stop Owner.Box.greeter");
    }
}
