//! Process launching and output streaming.
//!
//! This module turns `ExecutionOptions` into a spawned interpreter process and
//! provides the reader that turns a child's stdout/stderr into
//! `OutputEntry` values.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, error};

use crate::config::SupervisorSettings;
use crate::error::{Result, SupervisorError};
use crate::output::{decode_chunk, OutputEntry, StreamKind};
use crate::process::ExecutionOptions;
use crate::shell::{self, Platform, WindowPolicy};

/// Variables forced into every child so interpreters flush output promptly
/// and emit UTF-8.
pub const FORCED_ENV: [(&str, &str); 2] = [("PYTHONUNBUFFERED", "1"), ("PYTHONIOENCODING", "utf-8")];

const READ_CHUNK: usize = 8192;

/// A freshly spawned process.
#[derive(Debug)]
pub struct Launched {
    pub child: Child,
    pub pid: u32,
}

/// Builds the interpreter command for `options` without spawning it.
pub fn build_command(options: &ExecutionOptions, settings: &SupervisorSettings, platform: Platform) -> Command {
    let invocation = shell::resolve(options.shell, platform, options.is_service);
    let program = match (platform, settings.posix_shell.as_deref()) {
        (Platform::Posix, Some(custom)) => custom,
        _ => invocation.program,
    };

    let mut command = Command::new(program);
    push_args(&mut command, &invocation.prefix, &options.command);
    if let Some(dir) = &options.working_directory {
        command.current_dir(dir);
    }
    if !options.env.is_empty() {
        command.envs(&options.env);
    }
    for (key, value) in FORCED_ENV {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    if options.is_service {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
    configure_platform(&mut command, invocation.window);
    command
}

/// Spawns the interpreter for `options`.
pub fn launch(options: &ExecutionOptions, settings: &SupervisorSettings, platform: Platform) -> Result<Launched> {
    let mut command = build_command(options, settings, platform);
    let child = command.spawn().map_err(|e| {
        error!(command_id = %options.command_id, error = %e, "failed to spawn");
        SupervisorError::LaunchFailure(e.to_string())
    })?;
    let pid = child
        .id()
        .ok_or_else(|| SupervisorError::LaunchFailure("spawned process has no PID".into()))?;
    debug!(command_id = %options.command_id, pid, service = options.is_service, "spawned");
    Ok(Launched { child, pid })
}

#[cfg(windows)]
fn push_args(command: &mut Command, prefix: &[&str], text: &str) {
    // cmd.exe and powershell parse their own command line; pass it verbatim.
    for arg in prefix {
        command.raw_arg(arg);
    }
    command.raw_arg(text);
}

#[cfg(not(windows))]
fn push_args(command: &mut Command, prefix: &[&str], text: &str) {
    command.args(prefix).arg(text);
}

#[cfg(unix)]
fn configure_platform(command: &mut Command, _window: WindowPolicy) {
    // Own process group: the supervisor's signals don't cascade into it, and
    // a stop can signal the whole group.
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(windows)]
fn configure_platform(command: &mut Command, window: WindowPolicy) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    if window == WindowPolicy::Hidden {
        command.creation_flags(CREATE_NO_WINDOW);
    }
}

#[cfg(not(any(unix, windows)))]
fn configure_platform(_command: &mut Command, _window: WindowPolicy) {}

/// Reads `reader` until EOF, handing each decoded chunk to `sink`.
pub async fn read_stream<R, F>(reader: R, stream: StreamKind, platform: Platform, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(OutputEntry),
{
    let mut reader = reader;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink(OutputEntry::now(stream, decode_chunk(&buf[..n], platform))),
            Err(err) => {
                debug!(?stream, error = %err, "output stream closed with error");
                break;
            }
        }
    }
}
