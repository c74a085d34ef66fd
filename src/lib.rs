//! Runrack: a supervisor for project commands.
//!
//! Commands run under an explicit interpreter (bash, cmd or PowerShell),
//! either as services whose output is captured and whose listening ports are
//! discovered, or as one-off jobs. The [`Supervisor`] tracks at most one live
//! run per command, stops whole process trees, persists a runtime snapshot
//! and reports lifecycle changes as [`ProcessEvent`]s.

pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod persist;
pub mod ports;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod shell;
pub mod supervisor;
pub mod terminate;

pub use config::{load_config, CommandCatalog, Config, SupervisorSettings};
pub use error::{Result, SupervisorError};
pub use events::{ProcessEvent, Subscription, SubscriptionId};
pub use output::{OutputEntry, StreamKind};
pub use persist::{JsonFileStore, MemoryStore, RuntimeSnapshot, RuntimeStore};
pub use process::{CommandKind, ExecutionOptions, ExecutionResult, ProcessRecord, ProcessStatus, ShellKind};
pub use supervisor::Supervisor;
