//! Process termination and liveness probing.
//!
//! On Unix the spawned interpreter leads its own process group, so signals go
//! to the group (reaching every descendant that stayed in it) and then to the
//! PID itself. SIGTERM is followed by liveness polling; if the PID survives
//! the timeout, SIGKILL is sent and the stop is reported without waiting for
//! confirmation.
//!
//! On Windows `taskkill /F /T` removes the whole tree in one call, with a
//! single `TerminateProcess` on the root as the fallback.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};

/// Timing for a graceful-then-forced stop.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Terminates `pid` and its descendants.
///
/// `Err(TerminationFailure)` means the OS gave no usable confirmation; callers
/// still treat the run as gone.
pub async fn terminate_tree(pid: u32, policy: StopPolicy) -> Result<()> {
    terminate_platform(pid, policy).await
}

#[cfg(unix)]
async fn terminate_platform(pid: u32, policy: StopPolicy) -> Result<()> {
    if !send_unix_signal(pid, libc::SIGTERM) {
        return Err(SupervisorError::TerminationFailure {
            pid,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    debug!(pid, "sent SIGTERM");

    let deadline = tokio::time::Instant::now() + policy.timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            debug!(pid, "process exited after SIGTERM");
            return Ok(());
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
    if !is_alive(pid) {
        return Ok(());
    }

    // Not confirmed: the kill is sent and the stop reported as done.
    warn!(pid, "process survived SIGTERM, sending SIGKILL");
    send_unix_signal(pid, libc::SIGKILL);
    Ok(())
}

/// Signals the process group led by `pid`, then `pid` itself. Returns `true`
/// if either delivery succeeded.
#[cfg(unix)]
fn send_unix_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe {
        let group = libc::kill(-pid, signal) == 0;
        let direct = libc::kill(pid, signal) == 0;
        group || direct
    }
}

#[cfg(windows)]
async fn terminate_platform(pid: u32, policy: StopPolicy) -> Result<()> {
    use std::process::Stdio;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    // taskkill exit code when the PID no longer exists.
    const NOT_FOUND: i32 = 128;

    let mut command = tokio::process::Command::new("taskkill");
    command
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .kill_on_drop(true);

    match tokio::time::timeout(policy.timeout, command.status()).await {
        Ok(Ok(status)) if matches!(status.code(), Some(0) | Some(NOT_FOUND)) => {
            debug!(pid, "taskkill removed process tree");
            return Ok(());
        }
        Ok(Ok(status)) => warn!(pid, code = ?status.code(), "taskkill failed"),
        Ok(Err(err)) => warn!(pid, error = %err, "failed to run taskkill"),
        Err(_) => warn!(pid, "taskkill timed out"),
    }
    terminate_root_windows(pid)
}

#[cfg(windows)]
fn terminate_root_windows(pid: u32) -> Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return Err(SupervisorError::TerminationFailure {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        let ok = TerminateProcess(handle, 1) != 0;
        CloseHandle(handle);
        if ok {
            Ok(())
        } else {
            Err(SupervisorError::TerminationFailure {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            })
        }
    }
}

#[cfg(not(any(unix, windows)))]
async fn terminate_platform(pid: u32, _policy: StopPolicy) -> Result<()> {
    Err(SupervisorError::TerminationFailure {
        pid,
        reason: "unsupported platform".into(),
    })
}

/// Whether `pid` refers to a live process.
///
/// Zero-signal probe on Unix (a process owned by another user still counts
/// as alive); zombies are reported dead on Linux.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let Some(end) = stat.rfind(')') else {
        return false;
    };
    stat[end + 1..].trim_start().starts_with('Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    const STILL_ACTIVE: u32 = 259;

    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code) != 0;
        CloseHandle(handle);
        ok && code == STILL_ACTIVE
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::Instant;

    fn spawn_group_leader(script: &str) -> std::process::Child {
        use std::os::unix::process::CommandExt;
        let mut command = Command::new("sh");
        command
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }
        command.spawn().unwrap()
    }

    fn fast_policy() -> StopPolicy {
        StopPolicy {
            timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_process() {
        let mut child = spawn_group_leader("exec sleep 30");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let started = Instant::now();
        terminate_tree(pid, fast_policy()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
        reaper.join().unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn escalates_when_sigterm_is_ignored() {
        let mut child = spawn_group_leader("trap '' TERM; while true; do sleep 0.05; done");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        terminate_tree(pid, fast_policy()).await.unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn missing_pid_is_a_termination_failure() {
        let mut child = spawn_group_leader("exit 0");
        let pid = child.id();
        child.wait().unwrap();

        let err = terminate_tree(pid, fast_policy()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::TerminationFailure { .. }));
    }
}
