//! The operator and chat command surface: `mrm <command> [arg]`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::region::PrincipalId;

pub const ALL: &str = "all";
pub const NONE: &str = "none";

/// Help text shown for the console command.
pub const USAGE: &str = "mrm <command> [arg] - Commands that affect mini modules. <script> can be a name, 'all' or 'none'.\n\
mrm list - List all scripts currently initialised.\n\
mrm restart [script] - Shut down then restart a script. Without [script] the selected script is used.\n\
mrm select <script> - Set which script the other commands affect.\n\
mrm start [script] - Start a script. Nothing happens if it is already running.\n\
mrm stop [script] - Shut down a script.\n\
mrm dispose [script] - Shut down and forget a script.\n\
mrm region [region] - Only react to commands while in this region. Without [region] every region reacts.\n\
mrm stats - Print capability counters.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Select(String),
    Start(Option<String>),
    Stop(Option<String>),
    Restart(Option<String>),
    Dispose(Option<String>),
    List,
    Region(Option<String>),
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Command(Command),
    /// Only the prefix was given.
    Missing,
    Unknown(String),
}

impl Command {
    /// Parses whitespace separated tokens. The first token (`mrm`, `xmrm`) is ignored.
    pub fn parse(line: &str) -> ParseOutcome {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.get(1) else {
            return ParseOutcome::Missing;
        };
        let arg = tokens.get(2).map(|arg| arg.to_string());
        let parsed = match command.to_ascii_lowercase().as_str() {
            "select" => Command::Select(tokens[2..].join(" ")),
            "start" => Command::Start(arg),
            "stop" => Command::Stop(arg),
            "restart" | "reset" => Command::Restart(arg),
            "dispose" => Command::Dispose(arg),
            "list" => Command::List,
            "region" => Command::Region(arg),
            "stats" => Command::Stats,
            other => return ParseOutcome::Unknown(other.to_string()),
        };
        ParseOutcome::Command(parsed)
    }
}

/// What a command applies to once the selection has been consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Named(String),
}

/// Per-principal selection plus the region filter.
#[derive(Default)]
pub struct CommandState {
    selected: Mutex<HashMap<PrincipalId, Option<String>>>,
    region: Mutex<Option<String>>,
}

impl CommandState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self, principal: PrincipalId) -> Option<String> {
        self.selected.lock().get(&principal).cloned().flatten()
    }

    pub fn select(&self, principal: PrincipalId, script: Option<String>) {
        self.selected.lock().insert(principal, script);
    }

    pub fn region_filter(&self) -> Option<String> {
        self.region.lock().clone()
    }

    /// `all`, `none` or nothing clears the filter.
    pub fn set_region_filter(&self, region: Option<String>) {
        let region = region.filter(|name| !is_keyword(name, ALL) && !is_keyword(name, NONE));
        *self.region.lock() = region;
    }

    /// Whether commands should run in `region`.
    pub fn accepts_region(&self, region: &str) -> bool {
        self.region.lock().as_deref().map_or(true, |filter| filter == region)
    }

    /// The explicit argument wins, otherwise the principal's selection.
    pub fn target(&self, principal: PrincipalId, arg: Option<String>) -> Option<Target> {
        let name = arg.or_else(|| self.selected(principal))?;
        if is_keyword(&name, ALL) {
            Some(Target::All)
        } else {
            Some(Target::Named(name))
        }
    }
}

pub fn is_keyword(text: &str, keyword: &str) -> bool {
    text.eq_ignore_ascii_case(keyword)
}

/// One row of `list`: `{name:<70} {owner:<15} {running}`.
pub fn list_row(name: &str, owner: &str, running: &str) -> String {
    format!("{name:<70} {owner:<15} {running}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parses_commands_case_insensitively() {
        assert_eq!(Command::parse("XMRM Start Owner.Box.Item"), ParseOutcome::Command(Command::Start(Some("Owner.Box.Item".into()))));
        assert_eq!(Command::parse("mrm stop"), ParseOutcome::Command(Command::Stop(None)));
        assert_eq!(Command::parse("mrm LIST"), ParseOutcome::Command(Command::List));
        assert_eq!(Command::parse("mrm select two words"), ParseOutcome::Command(Command::Select("two words".into())));
        assert_eq!(Command::parse("mrm"), ParseOutcome::Missing);
        assert_eq!(Command::parse("mrm frobnicate"), ParseOutcome::Unknown("frobnicate".into()));
    }

    #[test]
    fn selection_is_per_principal() {
        let state = CommandState::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        state.select(alice, Some("A.Box.Item".into()));
        assert_eq!(state.target(alice, None), Some(Target::Named("A.Box.Item".into())));
        assert_eq!(state.target(bob, None), None);
        assert_eq!(state.target(bob, Some("ALL".into())), Some(Target::All));
        state.select(alice, None);
        assert_eq!(state.target(alice, None), None);
    }

    #[test]
    fn region_filter_gates_commands() {
        let state = CommandState::new();
        assert!(state.accepts_region("Anywhere"));
        state.set_region_filter(Some("Home".into()));
        assert!(state.accepts_region("Home"));
        assert!(!state.accepts_region("Elsewhere"));
        state.set_region_filter(Some("none".into()));
        assert!(state.accepts_region("Elsewhere"));
    }

    #[test]
    fn list_rows_are_padded() {
        let row = list_row("Name", "Owner", "Running?");
        assert_eq!(row.len(), 70 + 1 + 15 + 1 + "Running?".len());
        assert!(row.starts_with("Name "));
    }
}
