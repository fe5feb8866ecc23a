//! Configuration resolution for forkline.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/forkline/settings.json)
//! 3. Project config (.forkline/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete forkline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where a newly created demultiplexer goes relative to its neighbor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StagePosition {
    #[default]
    Above,
    Below,
}

impl std::str::FromStr for StagePosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "above" => Ok(Self::Above),
            "below" => Ok(Self::Below),
            other => Err(Error::Config(format!(
                "invalid position '{other}', expected 'above' or 'below'"
            ))),
        }
    }
}

/// Fork channel setup defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MuxConfig {
    /// Insert a demultiplexer into the shared pipeline when none exists.
    pub create_if_absent: bool,
    /// Position of an auto-created demultiplexer relative to `neighbor`.
    pub position: StagePosition,
    /// Name of the shared-pipeline stage an auto-created demultiplexer is
    /// placed next to. `None` places it at the top of the pipeline.
    pub neighbor: Option<String>,
    /// Fail setup when the group already has a private pipeline.
    pub require_fresh_group: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            create_if_absent: true,
            position: StagePosition::Above,
            neighbor: None,
            require_fresh_group: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    resolve_config(global_config_path().as_deref(), project_dir, |key| std::env::var(key).ok())
}

fn resolve_config<F>(global: Option<&Path>, project_dir: Option<&Path>, var: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = Config::default();

    for path in global
        .map(Path::to_path_buf)
        .into_iter()
        .chain(project_dir.map(|d| d.join(".forkline").join("settings.json")))
    {
        if path.exists() {
            merge_config(&mut config, read_json(&path)?);
            debug!(path = %path.display(), "Applied config file");
        }
    }

    apply_env_overrides(&mut config, var)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".forkline").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/forkline/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("forkline").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    read_json(path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Fields a config file actually sets. Anything missing keeps the value
/// from the layer below.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    #[serde(default)]
    mux: MuxOverlay,
    #[serde(default)]
    log: LogOverlay,
}

#[derive(Debug, Default, Deserialize)]
struct MuxOverlay {
    create_if_absent: Option<bool>,
    position: Option<StagePosition>,
    neighbor: Option<String>,
    require_fresh_group: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LogOverlay {
    level: Option<String>,
    json: Option<bool>,
}

fn merge_config(base: &mut Config, overlay: ConfigOverlay) {
    let ConfigOverlay { mux, log } = overlay;
    if let Some(v) = mux.create_if_absent {
        base.mux.create_if_absent = v;
    }
    if let Some(v) = mux.position {
        base.mux.position = v;
    }
    if mux.neighbor.is_some() {
        base.mux.neighbor = mux.neighbor;
    }
    if let Some(v) = mux.require_fresh_group {
        base.mux.require_fresh_group = v;
    }
    if let Some(v) = log.level {
        base.log.level = v;
    }
    if let Some(v) = log.json {
        base.log.json = v;
    }
}

fn apply_env_overrides<F>(config: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = var("FORKLINE_CREATE_IF_ABSENT") {
        config.mux.create_if_absent = parse_bool("FORKLINE_CREATE_IF_ABSENT", &val)?;
    }
    if let Some(val) = var("FORKLINE_POSITION") {
        config.mux.position = val.parse()?;
    }
    if let Some(val) = var("FORKLINE_NEIGHBOR") {
        config.mux.neighbor = Some(val).filter(|v| !v.is_empty());
    }
    if let Some(val) = var("FORKLINE_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = var("FORKLINE_LOG_JSON") {
        config.log.json = parse_bool("FORKLINE_LOG_JSON", &val)?;
    }
    Ok(())
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got '{val}'"))),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_allow_auto_creation_above_top() {
        let config = Config::default();
        assert!(config.mux.create_if_absent);
        assert_eq!(config.mux.position, StagePosition::Above);
        assert!(config.mux.neighbor.is_none());
        assert!(!config.mux.require_fresh_group);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"mux": {"neighbor": "NAKACK", "position": "below"}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.mux.neighbor.as_deref(), Some("NAKACK"));
        assert_eq!(config.mux.position, StagePosition::Below);
        assert!(config.mux.create_if_absent);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn project_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".forkline")).unwrap();
        std::fs::write(
            dir.path().join(".forkline").join("settings.json"),
            r#"{"mux": {"require_fresh_group": true}, "log": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = resolve_config(None, Some(dir.path()), |_| None).unwrap();
        assert!(config.mux.require_fresh_group);
        assert_eq!(config.log.level, "debug");
        assert!(config.mux.create_if_absent);
    }

    #[test]
    fn project_file_only_overrides_fields_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        std::fs::write(
            &global,
            r#"{"mux": {"create_if_absent": false, "position": "below", "neighbor": "NAKACK"},
                "log": {"level": "warn", "json": true}}"#,
        )
        .unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(project.join(".forkline")).unwrap();
        std::fs::write(
            project.join(".forkline").join("settings.json"),
            r#"{"log": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = resolve_config(Some(&global), Some(&project), |_| None).unwrap();
        assert!(!config.mux.create_if_absent);
        assert_eq!(config.mux.position, StagePosition::Below);
        assert_eq!(config.mux.neighbor.as_deref(), Some("NAKACK"));
        assert!(config.log.json);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn missing_files_leave_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("absent.json");
        let config = resolve_config(Some(&global), Some(dir.path()), |_| None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("FORKLINE_CREATE_IF_ABSENT", "false"),
            ("FORKLINE_POSITION", "BELOW"),
            ("FORKLINE_NEIGHBOR", "UNICAST"),
            ("FORKLINE_LOG_JSON", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).unwrap();
        assert!(!config.mux.create_if_absent);
        assert_eq!(config.mux.position, StagePosition::Below);
        assert_eq!(config.mux.neighbor.as_deref(), Some("UNICAST"));
        assert!(config.log.json);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = Config::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "FORKLINE_POSITION").then(|| "sideways".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
