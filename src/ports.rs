//! Listening-port discovery for service processes.
//!
//! Discovery shells out to the platform's socket listing tools: `lsof` on
//! Unix, `wmic` (process tree) plus `netstat -ano` on Windows, where the
//! interpreter's descendants usually own the sockets. Every tool failure is
//! absorbed and reported as "no ports".

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::output::decode_chunk;
use crate::shell::Platform;

const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

static LSOF_LISTEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)\s+\(LISTEN\)").expect("valid lsof pattern"));
static ADDRESS_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)$").expect("valid address pattern"));

/// When and how often discovery is attempted after a service starts.
#[derive(Debug, Clone, Copy)]
pub struct ScanSchedule {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            interval: Duration::from_secs(2),
            retries: 3,
        }
    }
}

/// Runs discovery on `schedule` until ports are found, retries run out, or
/// `still_running` reports the run is gone. `still_running` is consulted
/// before every attempt because a stop can land between attempts.
pub async fn scout<R, P, F>(schedule: ScanSchedule, still_running: R, mut probe: P) -> Option<Vec<u16>>
where
    R: Fn() -> bool,
    P: FnMut() -> F,
    F: Future<Output = Vec<u16>>,
{
    tokio::time::sleep(schedule.initial_delay).await;
    for attempt in 0..=schedule.retries {
        if attempt > 0 {
            tokio::time::sleep(schedule.interval).await;
        }
        if !still_running() {
            return None;
        }
        let ports = probe().await;
        if !ports.is_empty() {
            return Some(ports);
        }
        debug!(attempt, "no listening ports yet");
    }
    None
}

/// Listening TCP ports owned by `pid` (and, on Windows, its descendants).
pub async fn discover_ports(pid: u32, platform: Platform) -> Vec<u16> {
    let result = match platform {
        Platform::Posix => discover_posix(pid).await,
        Platform::Windows => discover_windows(pid).await,
    };
    match result {
        Ok(ports) => {
            debug!(pid, ?ports, "port discovery finished");
            ports
        }
        Err(err) => {
            warn!(pid, error = %err, "port discovery failed");
            Vec::new()
        }
    }
}

async fn discover_posix(pid: u32) -> Result<Vec<u16>> {
    let pid_arg = pid.to_string();
    let output = run_tool(
        "lsof",
        &["-iTCP", "-sTCP:LISTEN", "-n", "-P", "-p", &pid_arg],
        Platform::Posix,
    )
    .await?;
    Ok(parse_lsof(&output))
}

async fn discover_windows(pid: u32) -> Result<Vec<u16>> {
    let tree = match run_tool(
        "wmic",
        &["process", "get", "ParentProcessId,ProcessId"],
        Platform::Windows,
    )
    .await
    {
        Ok(table) => descendants(&parse_process_table(&table), pid),
        Err(err) => {
            warn!(pid, error = %err, "process tree lookup failed, using root only");
            vec![pid]
        }
    };
    debug!(pid, ?tree, "process tree");
    let owners: HashSet<u32> = tree.into_iter().collect();
    let netstat = run_tool("netstat", &["-ano"], Platform::Windows).await?;
    Ok(parse_netstat(&netstat, &owners))
}

async fn run_tool(program: &str, args: &[&str], platform: Platform) -> Result<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    let output = tokio::time::timeout(TOOL_TIMEOUT, command.output())
        .await
        .map_err(|_| SupervisorError::DiscoveryFailure(format!("{program} timed out")))?
        .map_err(|e| SupervisorError::DiscoveryFailure(format!("{program}: {e}")))?;
    Ok(decode_chunk(&output.stdout, platform))
}

/// Ports from `lsof -iTCP -sTCP:LISTEN` output, deduplicated in order.
pub fn parse_lsof(output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let Some(caps) = LSOF_LISTEN.captures(line) else {
            continue;
        };
        if let Ok(port) = caps[1].parse::<u16>() {
            push_unique(&mut ports, port);
        }
    }
    ports
}

/// Parent → children map from `wmic process get ParentProcessId,ProcessId`.
pub fn parse_process_table(output: &str) -> HashMap<u32, Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(parent), Some(pid)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(parent), Ok(pid)) = (parent.parse::<u32>(), pid.parse::<u32>()) else {
            continue;
        };
        if parent > 0 && pid > 0 {
            children.entry(parent).or_default().push(pid);
        }
    }
    children
}

/// `root` followed by every transitive child, breadth-first.
pub fn descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut seen = HashSet::from([root]);
    let mut result = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for &child in children.get(&current).into_iter().flatten() {
            if seen.insert(child) {
                result.push(child);
                queue.push_back(child);
            }
        }
    }
    result
}

/// Ports in `LISTENING` rows of `netstat -ano` owned by one of `owners`.
pub fn parse_netstat(output: &str, owners: &HashSet<u32>) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in output.lines() {
        if !line.contains("LISTENING") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }
        let Ok(owner) = parts[parts.len() - 1].parse::<u32>() else {
            continue;
        };
        if !owners.contains(&owner) {
            continue;
        }
        let Some(caps) = ADDRESS_PORT.captures(parts[1]) else {
            continue;
        };
        if let Ok(port) = caps[1].parse::<u16>() {
            if port > 0 {
                push_unique(&mut ports, port);
            }
        }
    }
    ports
}

fn push_unique(ports: &mut Vec<u16>, port: u16) {
    if !ports.contains(&port) {
        ports.push(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const LSOF: &str = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
node    41234 dev    23u  IPv6 0x1234      0t0  TCP *:3000 (LISTEN)
node    41234 dev    24u  IPv4 0x5678      0t0  TCP 127.0.0.1:9229 (LISTEN)
node    41234 dev    25u  IPv6 0x9abc      0t0  TCP [::1]:3000 (LISTEN)
node    41234 dev    26u  IPv4 0xdef0      0t0  TCP 127.0.0.1:3000->127.0.0.1:50123 (ESTABLISHED)
";

    const WMIC: &str = "\
ParentProcessId  ProcessId
0                0
0                4
100              200
200              300
200              301
300              400
999              500
";

    const NETSTAT: &str = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       900
  TCP    0.0.0.0:5173           0.0.0.0:0              LISTENING       300
  TCP    [::]:5173              [::]:0                 LISTENING       300
  TCP    127.0.0.1:8080         0.0.0.0:0              LISTENING       400
  TCP    127.0.0.1:8080         127.0.0.1:61000        ESTABLISHED     400
  TCP    0.0.0.0:7000           0.0.0.0:0              LISTENING       500
";

    #[test]
    fn lsof_keeps_listen_rows_only() {
        assert_eq!(parse_lsof(LSOF), vec![3000, 9229]);
        assert!(parse_lsof("").is_empty());
    }

    #[test]
    fn process_table_skips_header_and_zero_pids() {
        let table = parse_process_table(WMIC);
        assert!(!table.contains_key(&0));
        assert_eq!(table[&200], vec![300, 301]);
        assert_eq!(table[&300], vec![400]);
    }

    #[test]
    fn descendants_walk_breadth_first() {
        let table = parse_process_table(WMIC);
        assert_eq!(descendants(&table, 100), vec![100, 200, 300, 301, 400]);
        assert_eq!(descendants(&table, 42), vec![42]);
    }

    #[test]
    fn descendants_survive_cycles() {
        let table = HashMap::from([(1, vec![2]), (2, vec![1, 3])]);
        assert_eq!(descendants(&table, 1), vec![1, 2, 3]);
    }

    #[test]
    fn netstat_filters_to_tree() {
        let table = parse_process_table(WMIC);
        let owners: HashSet<u32> = descendants(&table, 100).into_iter().collect();
        assert_eq!(parse_netstat(NETSTAT, &owners), vec![5173, 8080]);
    }

    #[tokio::test]
    async fn scout_stops_on_first_hit() {
        let schedule = ScanSchedule {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            retries: 3,
        };
        let calls = Cell::new(0);
        let found = scout(schedule, || true, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n == 2 { vec![8080] } else { Vec::new() } }
        })
        .await;
        assert_eq!(found, Some(vec![8080]));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn scout_gives_up_after_retries() {
        let schedule = ScanSchedule {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            retries: 3,
        };
        let calls = Cell::new(0);
        let found = scout(schedule, || true, || {
            calls.set(calls.get() + 1);
            async { Vec::new() }
        })
        .await;
        assert_eq!(found, None);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn scout_checks_liveness_before_each_attempt() {
        let schedule = ScanSchedule {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            retries: 3,
        };
        let calls = Cell::new(0);
        let found = scout(
            schedule,
            || calls.get() < 1,
            || {
                calls.set(calls.get() + 1);
                async { Vec::new() }
            },
        )
        .await;
        assert_eq!(found, None);
        assert_eq!(calls.get(), 1);
    }
}
