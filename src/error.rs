//! Error types for the process supervisor.

use thiserror::Error;

/// Failures the supervisor can produce.
///
/// Launch and stop failures are folded into result values at the public
/// boundary; this enum is what those values are rendered from.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to spawn process: {0}")]
    LaunchFailure(String),

    #[error("Command is already running")]
    AlreadyRunning,

    #[error("Termination not confirmed for PID {pid}: {reason}")]
    TerminationFailure { pid: u32, reason: String },

    #[error("Port discovery failed: {0}")]
    DiscoveryFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Stable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Validation(_) => "RR001",
            SupervisorError::LaunchFailure(_) => "RR002",
            SupervisorError::AlreadyRunning => "RR003",
            SupervisorError::TerminationFailure { .. } => "RR004",
            SupervisorError::DiscoveryFailure(_) => "RR005",
            SupervisorError::Config(_) => "RR006",
            SupervisorError::Io(_) => "RR007",
            SupervisorError::Serialization(_) => "RR008",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
