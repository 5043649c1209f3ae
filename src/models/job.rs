use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};

use crate::models::remote::RemotePayload;
use crate::models::settings::Settings;

/// Status of a cavity detection job, local and remote views combined.
///
/// Declaration order is lifecycle order: a record only ever moves to a
/// variant that is declared later.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Unsubmitted,
    Queued,
    Running,
    Completed,
    TimedOut,
    // The job queue reports jobs it dropped as cancelled.
    #[serde(alias = "cancelled")]
    Failed,
}

impl JobStatus {
    /// Still waiting on the service.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Finished with a result payload to export.
    pub fn has_results(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    /// Whether moving from `self` to `next` follows the lifecycle.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next >= *self
    }
}

/// Local files involved in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFiles {
    /// Absolute path of the submitted structure; unknown for manually added jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ligand: Option<PathBuf>,

    /// Directory receiving `{output}/{id}/` artifacts.
    pub output: PathBuf,

    /// Prefix of exported file names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
}

/// One job tracked by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    id: Option<String>,
    status: JobStatus,
    pub files: JobFiles,
    /// `None` only for manually added jobs.
    pub settings: Option<Settings>,
    pub manually_added: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    payload: Option<RemotePayload>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RecordError {
    #[error("Job id is already set to {0}")]
    IdAlreadySet(String),

    #[error("Job status cannot move from {from} to {to}")]
    StatusRegression { from: JobStatus, to: JobStatus },

    #[error("Status {0} requires a result payload")]
    PayloadRequired(JobStatus),

    #[error("Status {0} cannot carry a result payload")]
    PayloadNotAllowed(JobStatus),
}

impl JobRecord {
    /// A job prepared locally but not yet accepted by the service.
    pub fn new(
        pdb: PathBuf,
        ligand: Option<PathBuf>,
        settings: Settings,
        output: PathBuf,
    ) -> Self {
        Self {
            id: None,
            status: JobStatus::Unsubmitted,
            files: JobFiles {
                pdb: Some(pdb),
                ligand,
                output,
                base_name: None,
            },
            settings: Some(settings),
            manually_added: false,
            submitted_at: None,
            payload: None,
        }
    }

    /// A job known only by the id the user typed in.
    pub fn manually_added(id: String, output: PathBuf) -> Self {
        Self {
            id: Some(id),
            status: JobStatus::Queued,
            files: JobFiles {
                pdb: None,
                ligand: None,
                output,
                base_name: None,
            },
            settings: None,
            manually_added: true,
            submitted_at: None,
            payload: None,
        }
    }

    /// Reassembles a record from persisted parts, enforcing the payload invariant.
    pub(crate) fn restore(
        id: String,
        status: JobStatus,
        files: JobFiles,
        settings: Option<Settings>,
        manually_added: bool,
        submitted_at: Option<DateTime<Utc>>,
        payload: Option<RemotePayload>,
    ) -> Result<Self, RecordError> {
        check_payload(status, payload.is_some())?;
        Ok(Self {
            id: Some(id),
            status,
            files,
            settings,
            manually_added,
            submitted_at,
            payload,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn payload(&self) -> Option<&RemotePayload> {
        self.payload.as_ref()
    }

    /// Name used for exported files, falling back to the job id.
    pub fn base_name(&self) -> Option<&str> {
        self.files.base_name.as_deref().or(self.id.as_deref())
    }

    /// Records the id assigned by the service and marks the job queued.
    pub fn mark_submitted(&mut self, id: String, at: DateTime<Utc>) -> Result<(), RecordError> {
        if let Some(existing) = &self.id {
            return Err(RecordError::IdAlreadySet(existing.clone()));
        }
        self.id = Some(id);
        self.status = JobStatus::Queued;
        self.submitted_at = Some(at);
        Ok(())
    }

    /// Moves to a status without results. Returns false when nothing changed.
    pub fn advance(&mut self, next: JobStatus) -> Result<bool, RecordError> {
        check_payload(next, false)?;
        self.transition(next)
    }

    /// Moves to `Completed`/`TimedOut` together with the payload that proves it.
    pub fn complete(&mut self, next: JobStatus, payload: RemotePayload) -> Result<(), RecordError> {
        check_payload(next, true)?;
        if self.status == next && self.payload.is_some() {
            return Ok(());
        }
        self.transition(next)?;
        self.payload = Some(payload);
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<bool, RecordError> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_advance_to(next) {
            return Err(RecordError::StatusRegression {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(true)
    }
}

fn check_payload(status: JobStatus, has_payload: bool) -> Result<(), RecordError> {
    match (status.has_results(), has_payload) {
        (true, false) => Err(RecordError::PayloadRequired(status)),
        (false, true) => Err(RecordError::PayloadNotAllowed(status)),
        _ => Ok(()),
    }
}
