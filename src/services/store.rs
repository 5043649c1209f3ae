//! File-backed job store.
//!
//! Every tracked job owns one directory under the jobs root:
//!
//! ```text
//! {jobs_dir}/{id}/job.toml    descriptor (status, files, settings)
//! {jobs_dir}/{id}/reply.json  finished reply, present once results arrived
//! ```
//!
//! The directory disappears once the job's results have been exported or the
//! service no longer knows the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::job::{JobFiles, JobRecord, JobStatus};
use crate::models::remote::RemotePayload;
use crate::models::settings::Settings;
use crate::services::atomic::write_atomic;

const DESCRIPTOR_FILE: &str = "job.toml";
const REPLY_FILE: &str = "reply.json";
const DESCRIPTOR_VERSION: u32 = 1;
const DESCRIPTOR_HEADER: &str = "# TOML configuration file for KVFinder-web job\n\n";

/// On-disk shape of `job.toml`.
#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    title: String,
    version: u32,
    id: String,
    status: JobStatus,
    #[serde(default)]
    id_added_manually: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    submitted_at: Option<DateTime<Utc>>,
    files: JobFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settings: Option<Settings>,
}

/// Durable store of locally tracked jobs.
pub struct JobStore {
    root: PathBuf,
    // Serializes filesystem access between the controller and the reconciliation task.
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the record's descriptor, creating its directory when needed.
    pub fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let id = record
            .id()
            .ok_or_else(|| StoreError::InvalidRecord("cannot store a job without an id".to_string()))?;
        let dir = self.job_dir(id)?;

        let descriptor = Descriptor {
            title: "KVFinder-web job file".to_string(),
            version: DESCRIPTOR_VERSION,
            id: id.to_string(),
            status: record.status(),
            id_added_manually: record.manually_added,
            submitted_at: record.submitted_at,
            files: record.files.clone(),
            settings: record.settings.clone(),
        };
        let body = format!("{}{}", DESCRIPTOR_HEADER, toml::to_string(&descriptor)?);

        let _guard = self.guard();
        fs::create_dir_all(&dir)?;

        // The reply lands before a finished descriptor, and is removed only
        // after an unfinished one, so a finished descriptor always has its reply.
        let reply_path = dir.join(REPLY_FILE);
        match record.payload() {
            Some(payload) => {
                write_atomic(&reply_path, &serde_json::to_vec_pretty(payload)?)?;
                write_atomic(&dir.join(DESCRIPTOR_FILE), body.as_bytes())?;
            }
            None => {
                write_atomic(&dir.join(DESCRIPTOR_FILE), body.as_bytes())?;
                remove_if_exists(&reply_path)?;
            }
        }

        tracing::debug!(job_id = %id, status = %record.status(), "Saved job descriptor");
        Ok(())
    }

    /// Rebuilds a record from its descriptor.
    pub fn load(&self, id: &str) -> Result<JobRecord, StoreError> {
        let dir = self.job_dir(id)?;
        let _guard = self.guard();

        let text = match fs::read_to_string(dir.join(DESCRIPTOR_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(id.to_string())),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let parse_error = |message: String| StoreError::Parse {
            id: id.to_string(),
            message,
        };

        let descriptor: Descriptor = toml::from_str(&text).map_err(|e| parse_error(e.to_string()))?;
        if descriptor.version != DESCRIPTOR_VERSION {
            return Err(parse_error(format!("unsupported descriptor version {}", descriptor.version)));
        }
        if descriptor.id != id {
            return Err(parse_error(format!("descriptor belongs to job {}", descriptor.id)));
        }
        if descriptor.settings.is_none() && !descriptor.id_added_manually {
            return Err(parse_error("missing [settings]".to_string()));
        }

        let mut status = descriptor.status;
        let payload = if status.has_results() {
            match fs::read(dir.join(REPLY_FILE)) {
                Ok(bytes) => Some(
                    serde_json::from_slice::<RemotePayload>(&bytes)
                        .map_err(|e| parse_error(format!("{}: {}", REPLY_FILE, e)))?,
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Interrupted save: poll the job again to recover the reply.
                    tracing::warn!(job_id = %id, %status, "Finished job has no saved reply, treating it as running");
                    status = JobStatus::Running;
                    None
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        } else {
            None
        };

        JobRecord::restore(
            descriptor.id,
            status,
            descriptor.files,
            descriptor.settings,
            descriptor.id_added_manually,
            descriptor.submitted_at,
            payload,
        )
        .map_err(|e| parse_error(e.to_string()))
    }

    /// Ids of all tracked jobs, in sorted order. A missing root means no jobs.
    pub fn list_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let _guard = self.guard();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_id(name) {
                    ids.insert(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Removes the job's directory tree. Succeeds if it is already gone.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.job_dir(id)?;
        let _guard = self.guard();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(job_id = %id, "Removed local job directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.job_dir(id)
            .map(|dir| dir.join(DESCRIPTOR_FILE).is_file())
            .unwrap_or(false)
    }

    fn job_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidRecord(format!("invalid job id {:?}", id)));
        }
        Ok(self.root.join(id))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ids become directory names, so they must be a single plain path component.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Job {0} is not tracked locally")]
    NotFound(String),

    #[error("Malformed descriptor for job {id}: {message}")]
    Parse { id: String, message: String },

    #[error("Failed to serialize job descriptor: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to serialize job reply: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),

    #[error("Job store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::remote::JobOutput;

    fn queued_record(id: &str) -> JobRecord {
        let mut record = JobRecord::new(
            PathBuf::from("/data/A.pdb"),
            Some(PathBuf::from("/data/ligand.pdb")),
            Settings::with_probe_out_and_removal_distance(6.0, 1.2),
            PathBuf::from("/data/results"),
        );
        record.mark_submitted(id.to_string(), Utc::now()).unwrap();
        record
    }

    fn payload() -> RemotePayload {
        RemotePayload {
            output: JobOutput {
                pdb_kv: "ATOM      1  N   MET A   1\n".to_string(),
                report: "[FILES_PATH]\nINPUT = \"./protein.pdb\"\n".to_string(),
                log: "Running parKVFinder for: ./protein.pdb\n".to_string(),
            },
            created_at: Some(Utc::now()),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let record = queued_record("42");

        store.save(&record).unwrap();
        let loaded = store.load("42").unwrap();

        assert_eq!(loaded, record);
        assert!(store.contains("42"));
    }

    #[test]
    fn test_round_trip_with_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut record = queued_record("42");
        record.complete(JobStatus::Completed, payload()).unwrap();

        store.save(&record).unwrap();
        assert_eq!(store.load("42").unwrap(), record);
    }

    #[test]
    fn test_finished_descriptor_without_reply_loads_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut record = queued_record("12");
        record.complete(JobStatus::Completed, payload()).unwrap();
        store.save(&record).unwrap();
        fs::remove_file(dir.path().join("12").join(REPLY_FILE)).unwrap();

        let loaded = store.load("12").unwrap();
        assert_eq!(loaded.status(), JobStatus::Running);
        assert!(loaded.payload().is_none());
        assert_eq!(loaded.settings, record.settings);
    }

    #[test]
    fn test_stray_reply_of_unfinished_job_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let record = queued_record("12");
        store.save(&record).unwrap();
        fs::write(
            dir.path().join("12").join(REPLY_FILE),
            serde_json::to_vec(&payload()).unwrap(),
        )
        .unwrap();

        let loaded = store.load("12").unwrap();
        assert_eq!(loaded.status(), JobStatus::Queued);
        assert!(loaded.payload().is_none());
    }

    #[test]
    fn test_saving_unfinished_status_drops_reply() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut finished = queued_record("12");
        finished.complete(JobStatus::Completed, payload()).unwrap();
        store.save(&finished).unwrap();

        store.save(&queued_record("12")).unwrap();
        assert!(!dir.path().join("12").join(REPLY_FILE).exists());
    }

    #[test]
    fn test_manual_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let record = JobRecord::manually_added("abc".to_string(), PathBuf::from("/out"));

        store.save(&record).unwrap();
        let loaded = store.load("abc").unwrap();

        assert!(loaded.manually_added);
        assert!(loaded.settings.is_none());
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut record = queued_record("42");
        store.save(&record).unwrap();

        record.advance(JobStatus::Running).unwrap();
        store.save(&record).unwrap();

        assert_eq!(store.load("42").unwrap().status(), JobStatus::Running);
        assert_eq!(store.list_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        assert!(matches!(store.load("nope"), Err(StoreError::NotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_load_without_settings_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        fs::create_dir_all(dir.path().join("42")).unwrap();
        fs::write(
            dir.path().join("42").join(DESCRIPTOR_FILE),
            "title = \"x\"\nversion = 1\nid = \"42\"\nstatus = \"queued\"\n\n[files]\noutput = \"/out\"\n",
        )
        .unwrap();

        assert!(matches!(store.load("42"), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn test_load_unknown_version_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save(&queued_record("42")).unwrap();

        let path = dir.path().join("42").join(DESCRIPTOR_FILE);
        let text = fs::read_to_string(&path).unwrap().replace("version = 1", "version = 7");
        fs::write(&path, text).unwrap();

        assert!(matches!(store.load("42"), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn test_list_ids_skips_stray_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save(&queued_record("b")).unwrap();
        store.save(&queued_record("a")).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();

        let ids: Vec<_> = store.list_ids().unwrap().into_iter().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_list_ids_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("missing"));
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save(&queued_record("42")).unwrap();

        store.delete("42").unwrap();
        store.delete("42").unwrap();
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_unwritable_root_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("file");
        fs::write(&root, "not a directory").unwrap();
        let store = JobStore::new(&root);

        assert!(matches!(store.save(&queued_record("42")), Err(StoreError::Io(_))));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
        assert!(is_valid_id("9824315063476182349"));
    }
}
