//! Background reconciliation of locally tracked jobs against KVFinder-web.
//!
//! One task runs [`ReconciliationLoop::run`]. Each cycle it lists the tracked
//! ids, makes sure the service is reachable, then handles the jobs one at a
//! time with a pause between them:
//!
//! - queued/running replies update the stored descriptor;
//! - completed/timed out replies are exported and the local record dropped;
//! - failed replies drop the local record;
//! - an unknown id (HTTP 404) is reported once as [`JobEvent::Expired`] and
//!   kept until the caller acknowledges it. While any acknowledgment is
//!   outstanding no local record is removed, but polling goes on.
//!
//! A connection failure or timeout marks the service as down. No job is
//! fetched again until a ping succeeds; pings are retried every
//! `offline_backoff`.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

use crate::app_state::AppState;
use crate::models::job::{JobRecord, JobStatus};
use crate::services::store::StoreError;

/// Timing knobs of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Delay between two cycles.
    pub poll_interval: Duration,
    /// Delay between two jobs of the same cycle.
    pub job_delay: Duration,
    /// Delay between pings while the service is down.
    pub offline_backoff: Duration,
    /// Ping once every this many skipped jobs whose results are already on disk.
    pub liveness_check_every: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            job_delay: Duration::from_secs(10),
            offline_backoff: Duration::from_secs(60),
            liveness_check_every: 10,
        }
    }
}

/// Notifications sent from the loop to whoever owns the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Updated { id: String, status: JobStatus },
    Exported { id: String, dir: std::path::PathBuf },
    ExportFailed { id: String, error: String },
    Failed { id: String },
    /// The service no longer knows the job. Its local record stays until
    /// acknowledged through the controller.
    Expired { id: String },
    ServiceDown,
    ServiceUp,
}

pub struct ReconciliationLoop {
    state: AppState,
    settings: ReconcileSettings,
    events: mpsc::UnboundedSender<JobEvent>,
    acks: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
    awaiting_ack: BTreeSet<String>,
    online: bool,
    skipped_since_ping: u32,
}

impl ReconciliationLoop {
    pub fn new(
        state: AppState,
        settings: ReconcileSettings,
        events: mpsc::UnboundedSender<JobEvent>,
        acks: mpsc::UnboundedReceiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            settings,
            events,
            acks,
            shutdown,
            awaiting_ack: BTreeSet::new(),
            online: true,
            skipped_since_ping: 0,
        }
    }

    /// Runs cycles until the stop signal is raised or its sender is dropped.
    pub async fn run(mut self) {
        tracing::info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            job_delay_ms = self.settings.job_delay.as_millis() as u64,
            "Reconciliation loop started"
        );

        loop {
            self.run_cycle().await;
            if self.pause(self.settings.poll_interval).await {
                break;
            }
        }

        tracing::info!(awaiting_ack = self.awaiting_ack.len(), "Reconciliation loop stopped");
    }

    /// One pass over all tracked jobs.
    pub async fn run_cycle(&mut self) {
        self.drain_acks().await;

        let store = self.state.store.clone();
        let ids = match blocking(move || store.list_ids()).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list tracked jobs");
                return;
            }
        };

        if ids.is_empty() || !self.online {
            if !self.wait_until_online().await || ids.is_empty() {
                return;
            }
        }

        tracing::debug!(jobs = ids.len(), "Checking tracked jobs");
        let mut processed = 0usize;
        for id in &ids {
            if self.is_stopped() || !self.online {
                return;
            }
            if self.awaiting_ack.contains(id) {
                continue;
            }
            if processed > 0 && self.pause(self.settings.job_delay).await {
                return;
            }
            self.reconcile_job(id).await;
            self.drain_acks().await;
            processed += 1;
        }
    }

    async fn reconcile_job(&mut self, id: &str) {
        let store = self.state.store.clone();
        let job_id = id.to_string();
        let mut record = match blocking(move || store.load(&job_id)).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Skipping job with unreadable descriptor");
                return;
            }
        };

        // Results already handled locally: nothing to fetch.
        if record.status().is_terminal() {
            self.finish_local(&record).await;
            return;
        }

        let reply = match self.state.client.fetch(id).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.mark_expired(id);
                return;
            }
            Err(e) if e.is_unreachable() => {
                tracing::warn!(job_id = %id, error = %e, "Service unreachable while fetching job");
                metrics::counter!("kvfinder_fetch_errors_total").increment(1);
                self.set_online(false);
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to fetch job, will retry next cycle");
                metrics::counter!("kvfinder_fetch_errors_total").increment(1);
                return;
            }
        };

        let status = reply.status;
        if status.has_results() {
            let Some(payload) = reply.into_payload() else {
                tracing::warn!(job_id = %id, %status, "Finished job reply carries no output, will retry");
                return;
            };
            if let Err(e) = record.complete(status, payload) {
                tracing::warn!(job_id = %id, error = %e, "Ignoring job reply");
                return;
            }
            if !self.persist(&record).await {
                return;
            }
            self.emit(JobEvent::Updated {
                id: id.to_string(),
                status,
            });
            self.export(&record).await;
            return;
        }

        match record.advance(status) {
            Ok(true) => {
                if !self.persist(&record).await {
                    return;
                }
                tracing::info!(job_id = %id, %status, "Job status changed");
                if status == JobStatus::Failed {
                    self.emit(JobEvent::Failed { id: id.to_string() });
                    self.remove(id).await;
                } else {
                    self.emit(JobEvent::Updated {
                        id: id.to_string(),
                        status,
                    });
                }
            }
            Ok(false) => tracing::debug!(job_id = %id, %status, "Job status unchanged"),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Ignoring job reply"),
        }
    }

    /// A record whose outcome is already known locally: retry a failed
    /// export, or finish a removal that was deferred.
    async fn finish_local(&mut self, record: &JobRecord) {
        let Some(id) = record.id() else { return };

        if record.status().has_results() {
            let exporter = self.state.exporter.clone();
            let snapshot = record.clone();
            let exported = tokio::task::spawn_blocking(move || exporter.is_exported(&snapshot))
                .await
                .unwrap_or(false);
            if !exported {
                self.export(record).await;
                return;
            }
        }

        if self.awaiting_ack.is_empty() {
            self.remove(id).await;
            return;
        }

        tracing::debug!(job_id = %id, "Results already on disk, removal deferred");
        self.skipped_since_ping += 1;
        if self.skipped_since_ping >= self.settings.liveness_check_every.max(1) {
            self.skipped_since_ping = 0;
            let up = self.state.client.ping().await;
            self.set_online(up);
        }
    }

    async fn export(&mut self, record: &JobRecord) {
        let Some(id) = record.id() else { return };
        let exporter = self.state.exporter.clone();
        let snapshot = record.clone();
        match blocking(move || exporter.export(&snapshot)).await {
            Ok(paths) => {
                metrics::counter!("kvfinder_jobs_exported_total").increment(1);
                if let Some(timings) = record.payload().map(|p| p.timings()) {
                    if let Some(running) = timings.running {
                        metrics::histogram!("kvfinder_job_run_seconds")
                            .record(running.num_milliseconds() as f64 / 1000.0);
                    }
                    tracing::info!(
                        job_id = %id,
                        queued_s = timings.queued.map(|d| d.num_seconds()),
                        running_s = timings.running.map(|d| d.num_seconds()),
                        total_s = timings.total.map(|d| d.num_seconds()),
                        "Job timings"
                    );
                }
                self.emit(JobEvent::Exported {
                    id: id.to_string(),
                    dir: paths.dir,
                });
                self.remove(id).await;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Export failed, will retry next cycle");
                self.emit(JobEvent::ExportFailed {
                    id: id.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn mark_expired(&mut self, id: &str) {
        if self.awaiting_ack.insert(id.to_string()) {
            tracing::warn!(job_id = %id, "Job is no longer known to the service, awaiting acknowledgment");
            metrics::counter!("kvfinder_jobs_expired_total").increment(1);
            self.emit(JobEvent::Expired { id: id.to_string() });
        }
    }

    /// Deletes a local record unless removals are paused by an outstanding acknowledgment.
    async fn remove(&mut self, id: &str) {
        if !self.awaiting_ack.is_empty() {
            tracing::debug!(job_id = %id, pending = self.awaiting_ack.len(), "Removal deferred until acknowledgment");
            return;
        }
        let store = self.state.store.clone();
        let job_id = id.to_string();
        if let Err(e) = blocking(move || store.delete(&job_id)).await {
            tracing::error!(job_id = %id, error = %e, "Failed to remove local job record");
        }
    }

    async fn drain_acks(&mut self) {
        while let Ok(id) = self.acks.try_recv() {
            if !self.awaiting_ack.remove(&id) {
                tracing::debug!(job_id = %id, "Acknowledgment for a job that is not awaiting one");
                continue;
            }
            let store = self.state.store.clone();
            let job_id = id.clone();
            match blocking(move || store.delete(&job_id)).await {
                Ok(()) => tracing::info!(job_id = %id, "Removed expired job after acknowledgment"),
                Err(e) => tracing::error!(job_id = %id, error = %e, "Failed to remove expired job"),
            }
        }
    }

    /// Pings until the service answers. Returns false if stopped meanwhile.
    async fn wait_until_online(&mut self) -> bool {
        loop {
            if self.state.client.ping().await {
                self.set_online(true);
                return true;
            }
            self.set_online(false);
            if self.pause(self.settings.offline_backoff).await {
                return false;
            }
            self.drain_acks().await;
        }
    }

    fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        if online {
            tracing::info!(server = %self.state.client.base_url(), "Service reachable again");
            self.emit(JobEvent::ServiceUp);
        } else {
            tracing::warn!(server = %self.state.client.base_url(), "Service unreachable, pausing job fetches");
            self.emit(JobEvent::ServiceDown);
        }
    }

    async fn persist(&mut self, record: &JobRecord) -> bool {
        let store = self.state.store.clone();
        let snapshot = record.clone();
        match blocking(move || store.save(&snapshot)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(job_id = ?record.id(), error = %e, "Failed to persist job record");
                false
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        // The receiver may be gone; the loop keeps working without listeners.
        let _ = self.events.send(event);
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps for `duration`. Returns true if the loop should stop.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}

/// Runs store and export work on tokio's blocking pool.
async fn blocking<T, E, F>(work: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
