use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{client::ClientError, client::ServiceClient, exporter::ResultExporter, store::JobStore};

/// Shared components used by both the controller and the reconciliation task.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub client: Arc<ServiceClient>,
    pub exporter: Arc<ResultExporter>,
}

impl AppState {
    pub fn new(store: JobStore, client: ServiceClient, exporter: ResultExporter) -> Self {
        Self {
            store: Arc::new(store),
            client: Arc::new(client),
            exporter: Arc::new(exporter),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ClientError> {
        let client = ServiceClient::new(&config.server_url, config.request_timeout())?;
        Ok(Self::new(JobStore::new(&config.jobs_dir), client, ResultExporter::new()))
    }
}
