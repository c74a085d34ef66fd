//! Configuration management for Runrack.
//!
//! This module defines the structure of the `runrack.toml` file: supervisor
//! settings plus the catalog of projects and their commands. The catalog is
//! exposed to the supervisor through the `CommandCatalog` trait.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::SupervisorError;
use crate::output::DEFAULT_OUTPUT_CAPACITY;
use crate::ports::ScanSchedule;
use crate::process::{CommandKind, ShellKind};
use crate::terminate::StopPolicy;

/// Tunables for the supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Maximum number of output entries kept per service run.
    pub output_capacity: usize,
    /// Entries returned by output queries when no limit is given.
    pub default_output_limit: usize,
    /// Delay before the first port discovery attempt (ms).
    pub port_scan_delay_ms: u64,
    /// Delay between port discovery retries (ms).
    pub port_scan_interval_ms: u64,
    /// Port discovery attempts after the first one.
    pub port_scan_retries: u32,
    /// Time allowed for a graceful stop before forcing (ms).
    pub stop_timeout_ms: u64,
    /// Liveness polling interval while stopping (ms).
    pub stop_poll_interval_ms: u64,
    /// POSIX shell used instead of `/bin/bash`.
    pub posix_shell: Option<String>,
    /// Location of the persisted runtime snapshot.
    pub state_file: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            default_output_limit: 100,
            port_scan_delay_ms: 2000,
            port_scan_interval_ms: 2000,
            port_scan_retries: 3,
            stop_timeout_ms: 3000,
            stop_poll_interval_ms: 100,
            posix_shell: None,
            state_file: None,
        }
    }
}

impl SupervisorSettings {
    pub fn scan_schedule(&self) -> ScanSchedule {
        ScanSchedule {
            initial_delay: Duration::from_millis(self.port_scan_delay_ms),
            interval: Duration::from_millis(self.port_scan_interval_ms),
            retries: self.port_scan_retries,
        }
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            timeout: Duration::from_millis(self.stop_timeout_ms),
            poll_interval: Duration::from_millis(self.stop_poll_interval_ms.max(1)),
        }
    }
}

/// Top-level configuration structure corresponding to `runrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: SupervisorSettings,
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// A project: a named group of commands sharing a default directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub name: Option<String>,
    /// Default working directory for the project's commands.
    pub path: Option<PathBuf>,
    #[serde(rename = "command", default)]
    pub commands: Vec<CommandConfig>,
}

/// A user-defined command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub id: String,
    pub name: Option<String>,
    /// Shell text to run.
    pub command: String,
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(rename = "type", default)]
    pub kind: CommandKind,
    pub working_directory: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

/// Lookup interface the supervisor uses to resolve command identities.
pub trait CommandCatalog: Send + Sync {
    fn command(&self, project_id: &str, command_id: &str) -> Option<CommandConfig>;
    fn project(&self, project_id: &str) -> Option<ProjectConfig>;
}

impl CommandCatalog for Config {
    fn command(&self, project_id: &str, command_id: &str) -> Option<CommandConfig> {
        self.projects
            .iter()
            .find(|p| p.id == project_id)?
            .commands
            .iter()
            .find(|c| c.id == command_id)
            .cloned()
    }

    fn project(&self, project_id: &str) -> Option<ProjectConfig> {
        self.projects.iter().find(|p| p.id == project_id).cloned()
    }
}

impl Config {
    /// Checks the uniqueness and non-emptiness rules of the catalog.
    pub fn validate(&self) -> std::result::Result<(), SupervisorError> {
        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if project.id.trim().is_empty() {
                return Err(SupervisorError::Validation("project id must not be empty".into()));
            }
            if !project_ids.insert(project.id.as_str()) {
                return Err(SupervisorError::Validation(format!(
                    "duplicate project id \"{}\"",
                    project.id
                )));
            }
            let mut command_ids = HashSet::new();
            for command in &project.commands {
                if command.id.trim().is_empty() {
                    return Err(SupervisorError::Validation(format!(
                        "command id must not be empty in project \"{}\"",
                        project.id
                    )));
                }
                if !command_ids.insert(command.id.as_str()) {
                    return Err(SupervisorError::Validation(format!(
                        "duplicate command id \"{}\" in project \"{}\"",
                        command.id, project.id
                    )));
                }
                if command.command.trim().is_empty() {
                    return Err(SupervisorError::Validation(format!(
                        "command \"{}\" has no command text",
                        command.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Service command ids of `project_id`, in declaration order.
    pub fn service_ids(&self, project_id: &str) -> Vec<String> {
        self.projects
            .iter()
            .filter(|p| p.id == project_id)
            .flat_map(|p| p.commands.iter())
            .filter(|c| c.kind.is_service())
            .map(|c| c.id.clone())
            .collect()
    }
}

/// Loads, parses and validates the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
output_capacity = 200
port_scan_retries = 1
stop_timeout_ms = 500
state_file = "state/runtime.json"

[[project]]
id = "shop"
name = "Shop"
path = "/srv/shop"

[[project.command]]
id = "api"
command = "cargo run"
env = { RUST_LOG = "debug" }

[[project.command]]
id = "build"
type = "oneoff"
shell = "powershell"
command = "npm run build"
working_directory = "/srv/shop/web"

[[project]]
id = "docs"

[[project.command]]
id = "serve"
command = "mdbook serve"
"#;

    #[test]
    fn parses_settings_and_catalog() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.settings.output_capacity, 200);
        assert_eq!(config.settings.port_scan_retries, 1);
        assert_eq!(config.settings.port_scan_delay_ms, 2000);
        assert_eq!(config.settings.stop_policy().timeout, Duration::from_millis(500));
        assert_eq!(config.projects.len(), 2);

        let api = config.command("shop", "api").unwrap();
        assert_eq!(api.kind, CommandKind::Service);
        assert_eq!(api.shell, ShellKind::Bash);
        assert_eq!(api.env.unwrap()["RUST_LOG"], "debug");

        let build = config.command("shop", "build").unwrap();
        assert_eq!(build.kind, CommandKind::Oneoff);
        assert_eq!(build.shell, ShellKind::PowerShell);

        assert!(config.command("docs", "api").is_none());
        assert_eq!(
            config.project("shop").unwrap().path,
            Some(PathBuf::from("/srv/shop"))
        );
        assert_eq!(config.service_ids("shop"), vec!["api".to_string()]);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.projects.is_empty());
        assert_eq!(config.settings.output_capacity, 1000);
        assert_eq!(config.settings.default_output_limit, 100);
    }

    #[test]
    fn rejects_duplicate_command_ids() {
        let raw = r#"
[[project]]
id = "p"
[[project.command]]
id = "a"
command = "true"
[[project.command]]
id = "a"
command = "false"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate command id"));
    }

    #[test]
    fn rejects_duplicate_project_ids_and_blank_commands() {
        let dup: Config = toml::from_str("[[project]]\nid = \"p\"\n[[project]]\nid = \"p\"\n").unwrap();
        assert!(dup.validate().is_err());

        let blank: Config =
            toml::from_str("[[project]]\nid = \"p\"\n[[project.command]]\nid = \"a\"\ncommand = \"  \"\n")
                .unwrap();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runrack.toml");
        std::fs::write(&path, "[[project]\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }
}
