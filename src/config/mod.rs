use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::reconcile::ReconcileSettings;

/// Client configuration, read from `KVFINDER_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base URL of the KVFinder-web service
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Directory holding one descriptor directory per tracked job
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Directory receiving exported results
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Timeout applied to every HTTP request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delay between two reconciliation cycles, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Delay between two jobs of the same cycle, in seconds
    #[serde(default = "default_job_delay_secs")]
    pub job_delay_secs: u64,

    /// Delay between pings while the service is down, in seconds
    #[serde(default = "default_offline_backoff_secs")]
    pub offline_backoff_secs: u64,

    #[serde(default = "default_liveness_check_every")]
    pub liveness_check_every: u32,

    /// Emit JSON log lines instead of human readable ones
    #[serde(default)]
    pub log_json: bool,
}

fn default_server_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from(".KVFinder-web")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_job_delay_secs() -> u64 {
    10
}

fn default_offline_backoff_secs() -> u64 {
    60
}

fn default_liveness_check_every() -> u32 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("KVFINDER_").from_iter(vars)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            job_delay: Duration::from_secs(self.job_delay_secs),
            offline_backoff: Duration::from_secs(self.offline_backoff_secs),
            liveness_check_every: self.liveness_check_every,
        }
    }
}
