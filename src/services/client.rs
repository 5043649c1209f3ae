use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

use crate::models::remote::{CreateJobReply, CreateJobRequest, JobStatusReply};

/// Client for the KVFinder-web HTTP API.
///
/// Holds no job state; every call is independent. All requests share one
/// timeout, and a timeout is reported exactly like a refused connection.
pub struct ServiceClient {
    http: Client,
    base: Url,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }

        let http = Client::builder()
            .user_agent(concat!("kvfinder-web-client/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(ClientError::Config)?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// POST `{server}/create`. Returns the id assigned to the job.
    pub async fn create(&self, request: &CreateJobRequest) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.url("create"))
            .json(request)
            .send()
            .await
            .map_err(ClientError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Submission {
                status: status.as_u16(),
                body,
            });
        }

        let reply: CreateJobReply = response.json().await.map_err(ClientError::from_transport)?;
        tracing::debug!(job_id = %reply.id, "Service accepted job");
        Ok(reply.id)
    }

    /// GET `{server}/{id}`. `Ok(None)` means the service no longer knows the id.
    pub async fn fetch(&self, id: &str) -> Result<Option<JobStatusReply>, ClientError> {
        let response = self
            .http
            .get(self.url(id))
            .send()
            .await
            .map_err(ClientError::from_transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Fetch {
                status: status.as_u16(),
                body,
            });
        }

        let reply: JobStatusReply = response.json().await.map_err(ClientError::from_transport)?;
        Ok(Some(reply))
    }

    /// Reachability check against the server root. Never fails: any error,
    /// timeout or non-2xx answer counts as down.
    pub async fn ping(&self) -> bool {
        match self.http.get(self.url("")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Service ping failed");
                false
            }
        }
    }

    /// Appends one percent-encoded path segment to the base URL.
    fn url(&self, segment: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(segment);
        }
        url
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Job submission rejected with HTTP {status}: {body}")]
    Submission { status: u16, body: String },

    #[error("Job fetch failed with HTTP {status}: {body}")]
    Fetch { status: u16, body: String },

    #[error("Service unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("Malformed service reply: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("Failed to build HTTP client: {0}")]
    Config(#[source] reqwest::Error),

    #[error("Invalid service URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e)
        } else {
            Self::Unreachable(e)
        }
    }

    /// Connection failures and timeouts, as opposed to answers from the service.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
