//! Persisted runtime snapshot.
//!
//! The snapshot records, per project, the last known state of every run that
//! has not reached a terminal transition. It is a recovery aid read once at
//! startup, never the source of truth for what is running.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, SupervisorError};
use crate::process::{ProcessRecord, ProcessStatus};

/// Snapshot file format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Last known state of one command's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEntry {
    pub command_id: String,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ProcessRecord> for RuntimeEntry {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            command_id: record.command_id.clone(),
            status: record.status,
            pid: Some(record.pid),
            ports: record.ports.clone(),
            started_at: Some(record.started_at),
            exit_code: record.exit_code,
            error: record.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRuntime {
    pub project_id: String,
    #[serde(default)]
    pub runtime_status: Vec<RuntimeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub version: u32,
    #[serde(default)]
    pub projects: Vec<ProjectRuntime>,
}

impl Default for RuntimeSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            projects: Vec::new(),
        }
    }
}

impl RuntimeSnapshot {
    /// Inserts or replaces the entry for `entry.command_id` under `project_id`.
    pub fn upsert(&mut self, project_id: &str, entry: RuntimeEntry) {
        let index = match self.projects.iter().position(|p| p.project_id == project_id) {
            Some(index) => index,
            None => {
                self.projects.push(ProjectRuntime {
                    project_id: project_id.to_string(),
                    runtime_status: Vec::new(),
                });
                self.projects.len() - 1
            }
        };
        let statuses = &mut self.projects[index].runtime_status;
        match statuses.iter_mut().find(|s| s.command_id == entry.command_id) {
            Some(existing) => *existing = entry,
            None => statuses.push(entry),
        }
    }

    /// Removes `command_id` from every project. Returns `true` if anything
    /// was removed.
    pub fn remove(&mut self, command_id: &str) -> bool {
        let mut removed = false;
        for project in &mut self.projects {
            let before = project.runtime_status.len();
            project.runtime_status.retain(|s| s.command_id != command_id);
            removed |= project.runtime_status.len() != before;
        }
        removed
    }

    /// Keeps only entries for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &RuntimeEntry) -> bool) {
        for project in &mut self.projects {
            let project_id = project.project_id.clone();
            project.runtime_status.retain(|s| keep(&project_id, s));
        }
    }

    /// Every entry paired with its project id.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RuntimeEntry)> {
        self.projects.iter().flat_map(|p| {
            p.runtime_status
                .iter()
                .map(move |s| (p.project_id.as_str(), s))
        })
    }

    pub fn len(&self) -> usize {
        self.projects.iter().map(|p| p.runtime_status.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable home of the runtime snapshot.
pub trait RuntimeStore: Send + Sync {
    fn load(&self) -> Result<RuntimeSnapshot>;
    fn save(&self, snapshot: &RuntimeSnapshot) -> Result<()>;
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<RuntimeSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RuntimeSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

impl RuntimeStore for MemoryStore {
    fn load(&self) -> Result<RuntimeSnapshot> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, snapshot: &RuntimeSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(())
    }
}

/// JSON file store with atomic replace on write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuntimeStore for JsonFileStore {
    /// A missing file is an empty snapshot; unreadable or foreign content is
    /// an error.
    fn load(&self) -> Result<RuntimeSnapshot> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RuntimeSnapshot::default())
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: RuntimeSnapshot = serde_json::from_str(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SupervisorError::Validation(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Writes to a uniquely named sibling temp file, syncs, then renames over
    /// the target.
    fn save(&self, snapshot: &RuntimeSnapshot) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        let _ = tmp.as_file().sync_all();
        tmp.persist(&self.path).map_err(|e| e.error)?;
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(command_id: &str, pid: u32) -> RuntimeEntry {
        RuntimeEntry::from(&ProcessRecord::running(command_id, "proj", pid))
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut snap = RuntimeSnapshot::default();
        snap.upsert("proj", entry("api", 1));
        let mut updated = entry("api", 1);
        updated.ports = Some(vec![3000]);
        snap.upsert("proj", updated);
        snap.upsert("other", entry("web", 2));

        assert_eq!(snap.len(), 2);
        let (_, api) = snap.entries().find(|(_, e)| e.command_id == "api").unwrap();
        assert_eq!(api.ports, Some(vec![3000]));
    }

    #[test]
    fn remove_searches_all_projects() {
        let mut snap = RuntimeSnapshot::default();
        snap.upsert("a", entry("x", 1));
        snap.upsert("b", entry("y", 2));
        assert!(snap.remove("y"));
        assert!(!snap.remove("y"));
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn file_roundtrip_uses_camel_case_layout() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("runtime.json"));
        let mut snap = RuntimeSnapshot::default();
        snap.upsert("proj", entry("api", 77));
        store.save(&snap).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"projectId\""));
        assert!(raw.contains("\"runtimeStatus\""));
        assert!(raw.contains("\"commandId\""));
        assert_eq!(store.load().unwrap(), snap);
    }

    #[test]
    fn concurrent_saves_leave_a_readable_file() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::new(dir.path().join("runtime.json")));
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let mut snap = RuntimeSnapshot::default();
                        for n in 0..=(w + i) % 10 {
                            snap.upsert("proj", entry(&format!("cmd-{w}-{n}"), n as u32 + 1));
                        }
                        store.save(&snap).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(!store.load().unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "runtime.json")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        fs::write(&path, b"{ not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SupervisorError::Serialization(_)));
    }

    #[test]
    fn foreign_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        fs::write(&path, br#"{"version": 9, "projects": []}"#).unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SupervisorError::Validation(_)));
    }
}
