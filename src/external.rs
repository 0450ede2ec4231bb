//! External modules: source whose marker line names a module file elsewhere on disk instead of
//! carrying the module inline.
//!
//! ```text
//! //MRM:X -a tools/greeter.rhai -c demo.Greeter -g "first argument" second
//! ```
//!
//! `-f/--ConfigFile` points at a JSON file whose `external` section overrides the command line.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::compile::declarations::{self, MODULE_BASE_TYPE};
use crate::error::ConfigurationError;

const CONFIG_FILE: (&str, &str) = ("f", "ConfigFile");
const MODULE: (&str, &str) = ("a", "Assembly");
const ENTRY_TYPE: (&str, &str) = ("c", "Class");
const BASE_FOLDER: (&str, &str) = ("b", "BaseFolder");
const NO_SHADOW_COPY: &str = "s";
const GOD: &str = "g";

/// Settings as written on the marker line, before any config file is merged in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalArgs {
    pub config_file: Option<String>,
    pub module: Option<String>,
    pub entry_type: Option<String>,
    pub base_folder: Option<String>,
    pub shadow_copy: Option<bool>,
    pub god: Option<bool>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    external: ConfigSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigSection {
    assembly: Option<String>,
    class: Option<String>,
    base_folder: Option<String>,
    shadow_copy: Option<bool>,
    is_god: Option<bool>,
}

/// A validated external module ready to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalModule {
    pub config_file: Option<PathBuf>,
    pub module_path: PathBuf,
    pub entry_type: String,
    pub base_folder: PathBuf,
    pub shadow_copy: bool,
    pub god: bool,
    pub args: Vec<String>,
    pub source: String,
}

/// Splits on whitespace except inside double quotes.
pub fn split_arguments(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    for (index, segment) in text.split('"').enumerate() {
        if index % 2 == 1 {
            if !segment.is_empty() {
                args.push(segment.to_string());
            }
        } else {
            args.extend(segment.split_whitespace().map(str::to_string));
        }
    }
    args
}

/// Parses the whole source text as a command line whose program name is the marker.
pub fn parse(text: &str) -> ExternalArgs {
    let mut args = split_arguments(text);
    if !args.is_empty() {
        args.remove(0);
    }
    ExternalArgs {
        config_file: take_setting(&mut args, CONFIG_FILE),
        module: take_setting(&mut args, MODULE),
        entry_type: take_setting(&mut args, ENTRY_TYPE),
        base_folder: take_setting(&mut args, BASE_FOLDER),
        shadow_copy: take_flag(&mut args, NO_SHADOW_COPY).then_some(false),
        god: take_flag(&mut args, GOD).then_some(true),
        args,
    }
}

fn is_short(arg: &str, short: &str) -> bool {
    arg.strip_prefix('-').or_else(|| arg.strip_prefix('/')).is_some_and(|name| name.eq_ignore_ascii_case(short))
}

fn take_setting(args: &mut Vec<String>, (short, long): (&str, &str)) -> Option<String> {
    let position = args.iter().take(args.len().saturating_sub(1)).position(|arg| {
        is_short(arg, short) || arg.strip_prefix("--").is_some_and(|name| name == long)
    })?;
    let value = args.remove(position + 1);
    args.remove(position);
    Some(value)
}

fn take_flag(args: &mut Vec<String>, short: &str) -> bool {
    match args.iter().position(|arg| is_short(arg, short)) {
        Some(position) => {
            args.remove(position);
            true
        }
        None => false,
    }
}

fn load_config(path: &Path) -> Result<ConfigSection> {
    let text = fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    let config: ConfigFile =
        serde_json::from_str(&text).with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(config.external)
}

/// Merges the config file, resolves paths against `working_dir`, and checks that the module
/// file exists and declares the requested entry type.
pub fn resolve(text: &str, working_dir: &Path) -> Result<ExternalModule, ConfigurationError> {
    let mut settings = parse(text);
    let config_file = settings.config_file.as_ref().map(|file| working_dir.join(file));
    if let Some(path) = &config_file {
        let section = load_config(path).map_err(|err| {
            ConfigurationError::External(format!("Unable to load config file from '{}'. {err:#}", path.display()))
        })?;
        settings.module = section.assembly.or(settings.module);
        settings.entry_type = section.class.or(settings.entry_type);
        settings.base_folder = section.base_folder.or(settings.base_folder);
        settings.shadow_copy = section.shadow_copy.or(settings.shadow_copy);
        settings.god = section.is_god.or(settings.god);
    }

    let report = |message: &str, module: Option<&Path>| {
        let text = format!(
            "{message}\nClass      : {}\nAssembly   : {}\nConfig File: {}",
            settings.entry_type.as_deref().unwrap_or_default(),
            module.map(|path| path.display().to_string()).unwrap_or_default(),
            config_file.as_ref().map(|path| path.display().to_string()).unwrap_or_default(),
        );
        tracing::warn!("[xmrm] {text}");
        ConfigurationError::External(format!("Unable to initialise XMRM.\n{text}"))
    };

    let (module, entry_type) = match (&settings.module, &settings.entry_type) {
        (None, None) => {
            return Err(report(
                "No module or entry type specified.\nPlease include the flags '-a', '-c'.\n\
                 Alternatively specify a config file with the '-f' flag and add 'assembly' and 'class' \
                 to its 'external' section.",
                None,
            ))
        }
        (None, Some(_)) => {
            return Err(report(
                "No module specified.\nPlease include the flag '-a'.\n\
                 Alternatively specify a config file with the '-f' flag and add 'assembly' to its \
                 'external' section.",
                None,
            ))
        }
        (Some(_), None) => {
            return Err(report(
                "No entry type specified.\nPlease include the flag '-c'.\n\
                 Alternatively specify a config file with the '-f' flag and add 'class' to its \
                 'external' section.",
                None,
            ))
        }
        (Some(module), Some(entry_type)) => (module.clone(), entry_type.clone()),
    };

    // Base folder defaults to the directory of the config file, else of the module file.
    let anchor = config_file.clone().unwrap_or_else(|| working_dir.join(&module));
    let default_base = anchor.parent().map(Path::to_path_buf).unwrap_or_else(|| working_dir.to_path_buf());
    let base_folder = match &settings.base_folder {
        Some(folder) => default_base.join(folder),
        None => default_base,
    };
    let module_path = if config_file.is_some() { base_folder.join(&module) } else { working_dir.join(&module) };

    if !module_path.is_file() {
        return Err(report("Module file does not exist.", Some(&module_path)));
    }
    let source = fs::read_to_string(&module_path)
        .map_err(|err| report(&format!("Module file could not be read ({err})."), Some(&module_path)))?;
    let declared = declarations::declared_types(&source);
    match declared.iter().find(|declared| declared.name == entry_type) {
        None => return Err(report("Entry type is not declared in the module file.", Some(&module_path))),
        Some(declared) if declared.base != MODULE_BASE_TYPE => {
            return Err(report(
                &format!("Entry type does not derive from {MODULE_BASE_TYPE}."),
                Some(&module_path),
            ))
        }
        Some(_) => {}
    }

    Ok(ExternalModule {
        config_file,
        module_path,
        entry_type,
        base_folder,
        shadow_copy: settings.shadow_copy.unwrap_or(true),
        god: settings.god.unwrap_or(false),
        args: settings.args,
        source,
    })
}
