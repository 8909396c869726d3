//! Configuration loading for Nancy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comms::Store;
use crate::drivers::DriverKind;
use crate::error::{Error, Result};
use crate::gate::GatePolicy;
use crate::task::STATE_DIR;

/// Get the settings file path for a project.
pub fn get_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join("config.json")
}

/// Load settings from `<project>/.nancy/config.json`.
pub fn load_settings(project_root: &Path) -> Result<Settings> {
    let path = get_settings_path(project_root);

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings, falling back to defaults when no file exists.
///
/// A file that exists but does not parse is still an error.
pub fn load_settings_or_default(project_root: &Path) -> Result<Settings> {
    if get_settings_path(project_root).exists() {
        load_settings(project_root)
    } else {
        tracing::debug!("No settings file, using defaults");
        Ok(Settings::default())
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let command = settings.gate_command.trim();
    if command.is_empty() || command.contains(char::is_whitespace) {
        return Err(Error::Config(format!(
            "gate_command must be a single program name, got '{}'",
            settings.gate_command
        )));
    }
    Ok(())
}

/// Nancy settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// Host runtime adapter used for deploy/cleanup and sessions.
    #[serde(default)]
    pub driver: DriverKind,

    /// Program name the hook and agent instructions invoke.
    #[serde(default = "default_gate_command")]
    pub gate_command: String,

    /// Seconds before an abandoned in-flight message file is swept.
    #[serde(default = "default_partial_ttl_secs")]
    pub partial_ttl_secs: u64,

    /// Host tool names the gate never blocks.
    #[serde(default = "default_exempt_tools")]
    pub exempt_tools: Vec<String>,
}

fn default_gate_command() -> String {
    "nancy".to_string()
}

fn default_partial_ttl_secs() -> u64 {
    300
}

fn default_exempt_tools() -> Vec<String> {
    vec!["TodoWrite".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            gate_command: default_gate_command(),
            partial_ttl_secs: default_partial_ttl_secs(),
            exempt_tools: default_exempt_tools(),
        }
    }
}

impl Settings {
    pub fn store(&self) -> Store {
        Store::new().with_partial_ttl(Duration::from_secs(self.partial_ttl_secs))
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            gate_command: self.gate_command.clone(),
            exempt_tools: self.exempt_tools.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = load_settings_or_default(temp_dir.path()).unwrap();
        assert_eq!(settings.driver, DriverKind::Claude);
        assert_eq!(settings.gate_command, "nancy");
        assert_eq!(settings.partial_ttl_secs, 300);
        assert!(load_settings(temp_dir.path()).is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = get_settings_path(temp_dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"driver": "codex", "exempt_tools": []}"#).unwrap();

        let settings = load_settings_or_default(temp_dir.path()).unwrap();
        assert_eq!(settings.driver, DriverKind::Codex);
        assert_eq!(settings.gate_command, "nancy");
        assert!(settings.gate_policy().exempt_tools.is_empty());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = get_settings_path(temp_dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_or_default(temp_dir.path()),
            Err(Error::Config(_))
        ));

        std::fs::write(&path, r#"{"gate_command": "nancy --flag"}"#).unwrap();
        assert!(matches!(load_settings(temp_dir.path()), Err(Error::Config(_))));
    }
}
