//! Data structures describing a supervised run.
//!
//! This module defines what a caller asks for (`ExecutionOptions`), what it
//! gets back (`ExecutionResult`), and the tracked state of a live or finished
//! run (`ProcessRecord`).

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Interpreter a command is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// POSIX shell (`bash -c`).
    #[default]
    #[serde(alias = "posix-shell", alias = "sh")]
    Bash,
    /// Windows command interpreter (`cmd /c`).
    #[serde(alias = "cmd-interpreter")]
    Cmd,
    /// PowerShell (`powershell -NoProfile -Command`).
    #[serde(alias = "pwsh")]
    PowerShell,
}

/// Whether a command is a long-running service or a run-to-completion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Output captured, lifecycle tracked until stopped or exited.
    #[default]
    Service,
    /// Runs to completion, output not captured.
    #[serde(alias = "one-off")]
    Oneoff,
}

impl CommandKind {
    pub fn is_service(self) -> bool {
        matches!(self, CommandKind::Service)
    }
}

/// Lifecycle status of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawned and not yet observed to exit.
    Running,
    /// Exited on its own or was stopped.
    Stopped,
    /// The OS reported an error for the process after launch.
    Error,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }
}

/// Tracked state of one run of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub command_id: String,
    pub project_id: String,
    /// PID of the directly spawned interpreter.
    pub pid: u32,
    /// Listening TCP ports, set once discovery succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessRecord {
    /// Creates a record for a run that has just been spawned.
    pub fn running(command_id: &str, project_id: &str, pid: u32) -> Self {
        Self {
            command_id: command_id.to_string(),
            project_id: project_id.to_string(),
            pid,
            ports: None,
            started_at: Utc::now(),
            status: ProcessStatus::Running,
            exit_code: None,
            error: None,
        }
    }
}

/// Everything the launcher needs to run a command.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub command_id: String,
    pub project_id: String,
    /// Raw shell text passed to the interpreter.
    pub command: String,
    pub shell: ShellKind,
    pub working_directory: Option<PathBuf>,
    /// Overrides merged over the supervisor's environment.
    pub env: HashMap<String, String>,
    pub is_service: bool,
}

impl ExecutionOptions {
    pub fn new(
        command_id: impl Into<String>,
        project_id: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            project_id: project_id.into(),
            command: command.into(),
            shell: ShellKind::default(),
            working_directory: None,
            env: HashMap::new(),
            is_service: true,
        }
    }

    pub fn shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn oneoff(mut self) -> Self {
        self.is_service = false;
        self
    }
}

/// Outcome of an execution request. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ExecutionResult {
    pub fn started(command_id: &str, pid: u32) -> Self {
        Self {
            success: true,
            command_id: command_id.to_string(),
            pid: Some(pid),
            exit_code: None,
            error: None,
            output: None,
        }
    }

    pub fn failed(command_id: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            command_id: command_id.to_string(),
            pid: None,
            exit_code: None,
            error: Some(error.to_string()),
            output: None,
        }
    }
}
