//! Interpreter selection.
//!
//! Maps `(ShellKind, Platform, service/one-off)` to the program and argument
//! prefix used to run a command. Kept free of I/O so every combination can be
//! checked directly.

use crate::process::ShellKind;

/// POSIX shell used for every command on Unix-like platforms.
pub const POSIX_SHELL: &str = "/bin/bash";

/// Platform family, which decides interpreter and termination strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// How the spawned interpreter relates to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Attached to the supervisor with piped or discarded I/O.
    Attached,
    /// Windows service run: no console window, I/O piped.
    Hidden,
    /// Windows one-off run: a new console window the user can see.
    NewConsole,
}

/// Concrete invocation for a command: `program prefix... <command>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub program: &'static str,
    pub prefix: Vec<&'static str>,
    pub window: WindowPolicy,
}

/// Resolves the interpreter invocation for a command.
pub fn resolve(shell: ShellKind, platform: Platform, is_service: bool) -> ShellInvocation {
    match (platform, shell, is_service) {
        (Platform::Posix, _, _) => ShellInvocation {
            program: POSIX_SHELL,
            prefix: vec!["-c"],
            window: WindowPolicy::Attached,
        },
        (Platform::Windows, ShellKind::PowerShell, true) => ShellInvocation {
            program: "powershell.exe",
            prefix: vec!["-NoProfile", "-Command"],
            window: WindowPolicy::Hidden,
        },
        (Platform::Windows, ShellKind::Bash | ShellKind::Cmd, true) => ShellInvocation {
            program: "cmd.exe",
            prefix: vec!["/c"],
            window: WindowPolicy::Hidden,
        },
        (Platform::Windows, ShellKind::PowerShell, false) => ShellInvocation {
            program: "cmd.exe",
            prefix: vec![
                "/c",
                "start",
                "\"\"",
                "powershell.exe",
                "-NoProfile",
                "-NoExit",
                "-Command",
            ],
            window: WindowPolicy::NewConsole,
        },
        (Platform::Windows, ShellKind::Bash | ShellKind::Cmd, false) => ShellInvocation {
            program: "cmd.exe",
            prefix: vec!["/c", "start", "\"\"", "cmd.exe", "/k"],
            window: WindowPolicy::NewConsole,
        },
    }
}
