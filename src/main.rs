//! Runrack command-line front end.
//!
//! Loads the command catalog from `runrack.toml`, drives a [`Supervisor`] and
//! prints prefixed output. Logs go to stderr; stdout carries command output.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runrack::output::{sanitize_text, StreamKind};
use runrack::shell::Platform;
use runrack::{
    load_config, ports, reconcile, terminate, CommandCatalog, Config, JsonFileStore, MemoryStore, ProcessEvent,
    RuntimeStore, Subscription, Supervisor, SupervisorSettings,
};

const DEFAULT_CONFIG: &str = "runrack.toml";
const DEFAULT_STATE_FILE: &str = ".runrack/runtime.json";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "runrack",
    version,
    about = "Supervisor for project services and one-off commands",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to runrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep runtime state in memory instead of the state file.
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one command of a project.
    Run {
        project: String,
        command: String,
        /// Remove ANSI escape codes from printed output.
        #[arg(long)]
        strip_ansi: bool,
    },
    /// Start every service of a project.
    Up {
        project: String,
        /// Remove ANSI escape codes from printed output.
        #[arg(long)]
        strip_ansi: bool,
    },
    /// Print the listening ports of a process tree.
    Ports { pid: u32 },
    /// Prune dead entries from the state file.
    Reconcile,
    /// Print the persisted runtime state.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_catalog(cli.config.as_deref())?;

    let code = match &cli.command {
        Commands::Run {
            project,
            command,
            strip_ansi,
        } => {
            let supervisor = Supervisor::new(config.settings.clone(), open_store(&config.settings, cli.ephemeral));
            run_one(&supervisor, &config, project, command, *strip_ansi).await?
        }
        Commands::Up { project, strip_ansi } => {
            let supervisor = Supervisor::new(config.settings.clone(), open_store(&config.settings, cli.ephemeral));
            up(&supervisor, &config, project, *strip_ansi).await?
        }
        Commands::Ports { pid } => {
            let found = ports::discover_ports(*pid, Platform::current()).await;
            if found.is_empty() {
                println!("no listening ports for pid {pid}");
            } else {
                println!("{}", join_ports(&found));
            }
            0
        }
        Commands::Reconcile => {
            let store = open_store(&config.settings, cli.ephemeral);
            let report = reconcile::reconcile(store.as_ref(), terminate::is_alive)
                .context("failed to reconcile runtime state")?;
            println!("kept {}, pruned {}", report.kept, report.pruned);
            print_snapshot(store.as_ref())?;
            0
        }
        Commands::Status => {
            let store = open_store(&config.settings, cli.ephemeral);
            print_snapshot(store.as_ref())?;
            0
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("runrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_catalog(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load_config(path);
    }
    let default = Path::new(DEFAULT_CONFIG);
    if default.exists() {
        load_config(default)
    } else {
        Ok(Config::default())
    }
}

fn open_store(settings: &SupervisorSettings, ephemeral: bool) -> Arc<dyn RuntimeStore> {
    if ephemeral {
        return Arc::new(MemoryStore::new());
    }
    let path = settings
        .state_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    Arc::new(JsonFileStore::new(path))
}

async fn run_one(supervisor: &Supervisor, config: &Config, project: &str, command: &str, strip_ansi: bool) -> Result<i32> {
    let definition = config
        .command(project, command)
        .ok_or_else(|| anyhow!("unknown command \"{command}\" in project \"{project}\""))?;
    let mut subscription = supervisor.subscribe();
    let result = supervisor.run_command(config, project, command).await;
    if !result.success {
        bail!("{command}: {}", result.error.unwrap_or_default());
    }
    if !definition.kind.is_service() {
        return Ok(result.exit_code.unwrap_or(1));
    }
    let ids = vec![command.to_string()];
    stream_until_done(supervisor, &mut subscription, &ids, strip_ansi).await
}

async fn up(supervisor: &Supervisor, config: &Config, project: &str, strip_ansi: bool) -> Result<i32> {
    let ids = config.service_ids(project);
    if ids.is_empty() {
        bail!("project \"{project}\" has no services");
    }
    let mut subscription = supervisor.subscribe();
    let mut started = Vec::new();
    for result in supervisor.execute_many(config, project, &ids).await {
        if result.success {
            started.push(result.command_id);
        } else {
            eprintln!("[{}] {}", result.command_id, result.error.unwrap_or_default());
        }
    }
    if started.is_empty() {
        bail!("no services of \"{project}\" could be started");
    }
    stream_until_done(supervisor, &mut subscription, &started, strip_ansi).await
}

/// Prints events for `ids` until every run has ended or Ctrl-C arrives.
/// Returns the process exit code for the CLI.
async fn stream_until_done(
    supervisor: &Supervisor,
    subscription: &mut Subscription,
    ids: &[String],
    strip_ansi: bool,
) -> Result<i32> {
    let mut pending: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut joiner = LineJoiner::default();
    let mut code = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("stopping {} command(s)", pending.len());
                let remaining: Vec<String> = pending.iter().map(|id| id.to_string()).collect();
                for (id, stopped) in supervisor.stop_many(&remaining).await {
                    if !stopped {
                        eprintln!("[{id}] stop not confirmed");
                    }
                }
                return Ok(130);
            }
            event = subscription.events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !pending.contains(event.command_id()) {
                    continue;
                }
                match event {
                    ProcessEvent::Output { command_id, entry } => {
                        for line in joiner.push(&command_id, entry.stream, &entry.text) {
                            print_line(&command_id, &line, strip_ansi);
                        }
                    }
                    ProcessEvent::Ports { command_id, ports } => {
                        println!("[{command_id}] listening on {}", join_ports(&ports));
                    }
                    ProcessEvent::Exit { command_id, exit_code, signal } => {
                        let status = match (exit_code, signal) {
                            (Some(code), _) => code,
                            (None, Some(signal)) => 128 + signal,
                            (None, None) => 1,
                        };
                        if status != 0 {
                            code = status;
                        }
                        for line in joiner.flush(&command_id) {
                            print_line(&command_id, &line, strip_ansi);
                        }
                        eprintln!("[{command_id}] exited with {status}");
                        pending.remove(command_id.as_str());
                    }
                    ProcessEvent::Error { command_id, message } => {
                        for line in joiner.flush(&command_id) {
                            print_line(&command_id, &line, strip_ansi);
                        }
                        eprintln!("[{command_id}] error: {message}");
                        code = 1;
                        pending.remove(command_id.as_str());
                    }
                    ProcessEvent::Started { .. } => {}
                }
            }
        }
    }
    Ok(code)
}

fn print_line(command_id: &str, line: &str, strip_ansi: bool) {
    println!("[{command_id}] {}", sanitize_text(line, strip_ansi));
}

/// Reassembles lines that arrive split across output chunks, per command and
/// stream.
#[derive(Debug, Default)]
struct LineJoiner {
    partial: HashMap<(String, StreamKind), String>,
}

impl LineJoiner {
    /// Appends `text` and returns the lines it completes.
    fn push(&mut self, command_id: &str, stream: StreamKind, text: &str) -> Vec<String> {
        let buffer = self
            .partial
            .entry((command_id.to_string(), stream))
            .or_default();
        buffer.push_str(text);
        let Some(end) = buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = buffer.split_off(end + 1);
        let complete = std::mem::replace(buffer, rest);
        complete.lines().map(str::to_string).collect()
    }

    /// Takes the unterminated remainder of every stream of `command_id`.
    fn flush(&mut self, command_id: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            if let Some(rest) = self.partial.remove(&(command_id.to_string(), stream)) {
                if !rest.is_empty() {
                    lines.push(rest);
                }
            }
        }
        lines
    }
}

fn print_snapshot(store: &dyn RuntimeStore) -> Result<()> {
    let snapshot = store.load().context("failed to read runtime state")?;
    if snapshot.is_empty() {
        println!("no recorded runs");
        return Ok(());
    }
    for (project, entry) in snapshot.entries() {
        let pid = entry.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let ports = entry.ports.as_deref().map(join_ports).unwrap_or_else(|| "-".into());
        println!(
            "{project}\t{}\t{}\tpid {pid}\tports {ports}",
            entry.command_id,
            entry.status.as_str()
        );
    }
    Ok(())
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["runrack", "up", "shop", "--ephemeral", "--strip-ansi"]).unwrap();
        assert!(cli.ephemeral);
        match cli.command {
            Commands::Up { project, strip_ansi } => {
                assert_eq!(project, "shop");
                assert!(strip_ansi);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("absent.toml");
        assert!(load_catalog(Some(&explicit)).is_err());
    }

    #[test]
    fn lines_split_across_chunks_are_rejoined() {
        let mut joiner = LineJoiner::default();
        assert!(joiner.push("api", StreamKind::Stdout, "listening on 30").is_empty());
        assert!(joiner.push("api", StreamKind::Stderr, "warn: ").is_empty());
        assert_eq!(
            joiner.push("api", StreamKind::Stdout, "00\nready\npart"),
            vec!["listening on 3000".to_string(), "ready".to_string()]
        );
        assert_eq!(joiner.push("web", StreamKind::Stdout, "other\n"), vec!["other".to_string()]);
        assert_eq!(
            joiner.flush("api"),
            vec!["part".to_string(), "warn: ".to_string()]
        );
        assert!(joiner.flush("api").is_empty());
    }

    #[test]
    fn ports_are_joined_for_display() {
        assert_eq!(join_ports(&[3000, 8080]), "3000, 8080");
    }
}
