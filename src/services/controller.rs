use chrono::Utc;
use garde::Validate;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::app_state::AppState;
use crate::models::job::{JobRecord, RecordError};
use crate::models::remote::CreateJobRequest;
use crate::models::settings::Settings;
use crate::services::client::ClientError;
use crate::services::reconcile::{JobEvent, ReconcileSettings, ReconciliationLoop};
use crate::services::store::{is_valid_id, StoreError};

/// Entry point for callers: submits jobs, answers status queries and owns the
/// background [`ReconciliationLoop`].
///
/// The loop is built by [`JobController::new`] but only runs after
/// [`JobController::start`], so one-shot commands never poll. Dropping the
/// controller raises the stop signal; [`JobController::shutdown`] also waits
/// for the loop to finish its current request.
pub struct JobController {
    state: AppState,
    output_dir: PathBuf,
    ack_tx: mpsc::UnboundedSender<String>,
    event_rx: mpsc::UnboundedReceiver<JobEvent>,
    shutdown_tx: watch::Sender<bool>,
    pending: Option<ReconciliationLoop>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("Reconciliation loop is not running")]
    Stopped,
}

impl JobController {
    /// `output_dir` is made absolute against the current directory. It must
    /// not lie inside the job store, whose deletions would take exports along.
    pub fn new(
        state: AppState,
        output_dir: PathBuf,
        settings: ReconcileSettings,
    ) -> Result<Self, ControllerError> {
        let output_dir = std::path::absolute(&output_dir).unwrap_or(output_dir);
        let jobs_root = state.store.root();
        let jobs_root = std::path::absolute(jobs_root).unwrap_or_else(|_| jobs_root.to_path_buf());
        if output_dir.starts_with(&jobs_root) {
            return Err(ControllerError::Validation(format!(
                "output directory {} lies inside the job store {}",
                output_dir.display(),
                jobs_root.display()
            )));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pending = ReconciliationLoop::new(state.clone(), settings, event_tx, ack_rx, shutdown_rx);

        Ok(Self {
            state,
            output_dir,
            ack_tx,
            event_rx,
            shutdown_tx,
            pending: Some(pending),
            handle: None,
        })
    }

    /// Spawns the reconciliation loop on the current tokio runtime. Calling
    /// it again is a no-op.
    pub fn start(&mut self) {
        if let Some(reconciler) = self.pending.take() {
            tracing::info!(jobs_dir = %self.state.store.root().display(), "Starting job reconciliation");
            self.handle = Some(tokio::spawn(reconciler.run()));
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Sends a structure (and optional ligand) to the service and starts
    /// tracking the new job as `queued`.
    ///
    /// If the service hands back an id that is already tracked, the existing
    /// record is returned unchanged.
    pub async fn submit(
        &self,
        structure: Option<&Path>,
        ligand: Option<&Path>,
        mut settings: Settings,
    ) -> Result<JobRecord, ControllerError> {
        let structure = structure
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or_else(|| ControllerError::Validation("a structure file is required".to_string()))?;

        if ligand.is_some() {
            settings.modes.ligand_mode = true;
        }
        settings
            .validate()
            .map_err(|report| ControllerError::Validation(report.to_string()))?;

        let (pdb_path, pdb) = read_input(structure).await?;
        let (ligand_path, ligand_text) = match ligand {
            Some(path) => {
                let (path, text) = read_input(path).await?;
                (Some(path), Some(text))
            }
            None => (None, None),
        };

        let request = CreateJobRequest::new(settings.clone(), &pdb, ligand_text.as_deref());
        let id = self.state.client.create(&request).await?;

        if self.state.store.contains(&id) {
            tracing::info!(job_id = %id, "Service returned an already tracked job");
            return Ok(self.state.store.load(&id)?);
        }

        let mut record = JobRecord::new(pdb_path, ligand_path, settings, self.output_dir.clone());
        record.mark_submitted(id.clone(), Utc::now())?;
        self.state.store.save(&record)?;

        metrics::counter!("kvfinder_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %id, structure = %structure.display(), "Job submitted");
        Ok(record)
    }

    /// Starts tracking a job that was submitted elsewhere.
    pub fn add_existing(&self, id: &str) -> Result<JobRecord, ControllerError> {
        let id = id.trim();
        if !is_valid_id(id) {
            return Err(ControllerError::Validation(format!("invalid job id: {:?}", id)));
        }
        if self.state.store.contains(id) {
            return Ok(self.state.store.load(id)?);
        }

        let record = JobRecord::manually_added(id.to_string(), self.output_dir.clone());
        self.state.store.save(&record)?;
        tracing::info!(job_id = %id, "Tracking manually added job");
        Ok(record)
    }

    /// Latest persisted view of a job. Never contacts the service.
    pub fn status(&self, id: &str) -> Result<JobRecord, ControllerError> {
        Ok(self.state.store.load(id)?)
    }

    pub fn tracked_ids(&self) -> Result<BTreeSet<String>, ControllerError> {
        Ok(self.state.store.list_ids()?)
    }

    /// Confirms that the caller saw an [`JobEvent::Expired`] for `id`; the
    /// loop then deletes its record and resumes pending removals.
    pub fn acknowledge(&self, id: &str) -> Result<(), ControllerError> {
        self.ack_tx
            .send(id.to_string())
            .map_err(|_| ControllerError::Stopped)
    }

    /// Waits for the next loop event. `None` once the loop has stopped.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.pending.is_some() {
            return None;
        }
        self.event_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<JobEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Stops the loop between requests and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Reconciliation task ended abnormally");
            }
        }
        tracing::info!("Job controller shut down");
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn read_input(path: &Path) -> Result<(PathBuf, String), ControllerError> {
    let unreadable = |e: std::io::Error| {
        ControllerError::Validation(format!("cannot read {}: {}", path.display(), e))
    };
    let absolute = tokio::fs::canonicalize(path).await.map_err(unreadable)?;
    let text = tokio::fs::read_to_string(&absolute).await.map_err(unreadable)?;
    Ok((absolute, text))
}
