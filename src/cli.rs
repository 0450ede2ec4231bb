use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Options for the `minimod_host` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    pub config: Option<PathBuf>,
    pub watch: PathBuf,
    pub region: String,
    pub owner: String,
    /// Stop after this many frames. Runs until stdin closes when unset.
    pub frames: Option<u64>,
    pub frame_interval: Duration,
    pub autostart: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            config: None,
            watch: PathBuf::from("minimods"),
            region: "Sandbox".to_string(),
            owner: "Region Owner".to_string(),
            frames: None,
            frame_interval: Duration::from_millis(50),
            autostart: true,
        }
    }
}

impl HostOptions {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = HostOptions::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            if !flag.starts_with("--") {
                bail!("Unexpected argument '{flag}'. Use --config/--watch/--region/--owner/--frames/--frame-ms/--autostart with values.");
            }
            let key = &flag[2..];
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => options.config = Some(PathBuf::from(value)),
                "watch" => options.watch = PathBuf::from(value),
                "region" => options.region = value,
                "owner" => options.owner = value,
                "frames" => {
                    options.frames =
                        Some(value.parse::<u64>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "frame-ms" => {
                    let millis = value.parse::<u64>().with_context(|| format!("Invalid frame interval '{value}'"))?;
                    options.frame_interval = Duration::from_millis(millis);
                }
                "autostart" => options.autostart = parse_bool_flag("autostart", &value)?,
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --watch, --region, --owner, --frames, --frame-ms, --autostart."
                ),
            }
        }
        Ok(options)
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_frames() {
        let args = ["host", "--watch", "mods", "--config", "mrm.json", "--frames", "10", "--autostart", "off"];
        let options = HostOptions::parse(args).expect("parse options");
        assert_eq!(options.watch, PathBuf::from("mods"));
        assert_eq!(options.config, Some(PathBuf::from("mrm.json")));
        assert_eq!(options.frames, Some(10));
        assert!(!options.autostart);
        assert_eq!(options.region, "Sandbox");
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["host", "--frame-ms", "10", "--frame-ms", "25", "--region", "A", "--region", "B"];
        let options = HostOptions::parse(args).expect("parse options");
        assert_eq!(options.frame_interval, Duration::from_millis(25));
        assert_eq!(options.region, "B");
    }

    #[test]
    fn missing_value_errors() {
        let err = HostOptions::parse(["host", "--frames"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = HostOptions::parse(["host", "--foo", "bar"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = HostOptions::parse(["host", "--frames", "many"]).unwrap_err();
        assert!(err.to_string().contains("Invalid frame count"));
    }
}
