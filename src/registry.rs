//! In-memory registry of supervised runs.
//!
//! One entry per command identity. Each spawn gets a fresh `RunId`; callbacks
//! from background tasks (output readers, exit watchers, port discovery) carry
//! the `RunId` they were started for and are ignored once a newer run, or a
//! stop, has replaced their entry.

use std::collections::HashMap;

use crate::output::{OutputBuffer, OutputEntry};
use crate::process::{ProcessRecord, ProcessStatus};

pub type RunId = u64;

#[derive(Debug, Clone)]
struct Entry {
    record: ProcessRecord,
    run: RunId,
    live: bool,
    is_service: bool,
}

/// How an exit was applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The run was current; its record is kept with the terminal status.
    Recorded(ProcessRecord),
    /// The run was current and was a one-off; its record was dropped.
    Discarded,
    /// The run had already been stopped or replaced.
    Stale,
}

#[derive(Debug)]
pub struct Registry {
    capacity: usize,
    next_run: RunId,
    entries: HashMap<String, Entry>,
    buffers: HashMap<String, OutputBuffer>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_run: 1,
            entries: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Whether a run is currently live for `command_id`.
    pub fn is_live(&self, command_id: &str) -> bool {
        self.entries.get(command_id).is_some_and(|e| e.live)
    }

    /// Whether `run` is still the live run for `command_id`.
    pub fn is_current(&self, command_id: &str, run: RunId) -> bool {
        self.entries
            .get(command_id)
            .is_some_and(|e| e.live && e.run == run)
    }

    /// Whether `run` is the latest run recorded for `command_id`, live or not.
    pub fn owns(&self, command_id: &str, run: RunId) -> bool {
        self.entries.get(command_id).is_some_and(|e| e.run == run)
    }

    /// Registers a freshly spawned run, replacing any finished record and
    /// clearing output from previous runs.
    pub fn register(&mut self, record: ProcessRecord, is_service: bool) -> RunId {
        let run = self.next_run;
        self.next_run += 1;
        let command_id = record.command_id.clone();
        self.buffers.remove(&command_id);
        if is_service {
            self.buffers
                .insert(command_id.clone(), OutputBuffer::new(self.capacity));
        }
        self.entries.insert(
            command_id,
            Entry {
                record,
                run,
                live: true,
                is_service,
            },
        );
        run
    }

    /// Appends an output entry for the given run. Output that trails a
    /// natural exit is kept; output from a stopped or replaced run is not.
    pub fn append_output(&mut self, command_id: &str, run: RunId, entry: OutputEntry) -> bool {
        if !self.owns(command_id, run) {
            return false;
        }
        match self.buffers.get_mut(command_id) {
            Some(buffer) => {
                buffer.push(entry);
                true
            }
            None => false,
        }
    }

    /// Records discovered ports on the live run.
    pub fn set_ports(&mut self, command_id: &str, run: RunId, ports: Vec<u16>) -> Option<ProcessRecord> {
        let entry = self.entries.get_mut(command_id)?;
        if !entry.live || entry.run != run {
            return None;
        }
        entry.record.ports = Some(ports);
        Some(entry.record.clone())
    }

    /// Applies a natural exit of `run`.
    pub fn mark_exited(&mut self, command_id: &str, run: RunId, exit_code: Option<i32>) -> ExitOutcome {
        let Some(entry) = self.entries.get_mut(command_id) else {
            return ExitOutcome::Stale;
        };
        if !entry.live || entry.run != run {
            return ExitOutcome::Stale;
        }
        if !entry.is_service {
            self.entries.remove(command_id);
            return ExitOutcome::Discarded;
        }
        entry.live = false;
        entry.record.status = ProcessStatus::Stopped;
        entry.record.exit_code = exit_code;
        ExitOutcome::Recorded(entry.record.clone())
    }

    /// Applies an OS error reported for `run` after launch.
    pub fn mark_error(&mut self, command_id: &str, run: RunId, message: &str) -> ExitOutcome {
        let Some(entry) = self.entries.get_mut(command_id) else {
            return ExitOutcome::Stale;
        };
        if !entry.live || entry.run != run {
            return ExitOutcome::Stale;
        }
        if !entry.is_service {
            self.entries.remove(command_id);
            return ExitOutcome::Discarded;
        }
        entry.live = false;
        entry.record.status = ProcessStatus::Error;
        entry.record.error = Some(message.to_string());
        ExitOutcome::Recorded(entry.record.clone())
    }

    /// Removes the record and output buffer for `command_id`.
    pub fn remove(&mut self, command_id: &str) -> Option<ProcessRecord> {
        self.buffers.remove(command_id);
        self.entries.remove(command_id).map(|e| e.record)
    }

    /// Removes the entry only if `run` is still the one recorded.
    pub fn remove_run(&mut self, command_id: &str, run: RunId) -> Option<ProcessRecord> {
        if !self.owns(command_id, run) {
            return None;
        }
        self.remove(command_id)
    }

    /// PID and run of the live run, if any.
    pub fn live_run(&self, command_id: &str) -> Option<(u32, RunId)> {
        self.entries
            .get(command_id)
            .filter(|e| e.live)
            .map(|e| (e.record.pid, e.run))
    }

    pub fn record(&self, command_id: &str) -> Option<ProcessRecord> {
        self.entries.get(command_id).map(|e| e.record.clone())
    }

    /// All records, optionally filtered by project, oldest run first.
    pub fn records(&self, project_id: Option<&str>) -> Vec<ProcessRecord> {
        let mut entries: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| project_id.map_or(true, |p| e.record.project_id == p))
            .collect();
        entries.sort_by_key(|e| e.run);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Command identities with a live run, optionally filtered by project.
    pub fn live_ids(&self, project_id: Option<&str>) -> Vec<String> {
        let mut entries: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.live && project_id.map_or(true, |p| e.record.project_id == p))
            .collect();
        entries.sort_by_key(|e| e.run);
        entries
            .into_iter()
            .map(|e| e.record.command_id.clone())
            .collect()
    }

    /// Most recent `limit` output entries for `command_id`, oldest first.
    pub fn output(&self, command_id: &str, limit: usize) -> Vec<OutputEntry> {
        self.buffers
            .get(command_id)
            .map(|b| b.tail(limit))
            .unwrap_or_default()
    }
}
