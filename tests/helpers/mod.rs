//! Scripted stand-in for the KVFinder-web service, plus harness utilities

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use kvfinder_web_client::app_state::AppState;
use kvfinder_web_client::services::client::ServiceClient;
use kvfinder_web_client::services::controller::JobController;
use kvfinder_web_client::services::exporter::ResultExporter;
use kvfinder_web_client::services::reconcile::{JobEvent, ReconcileSettings};
use kvfinder_web_client::services::store::JobStore;

use crate::fixtures::{CAVITY_PDB, REPORT_TOML, RUN_LOG};

/// Client timeout used against the mock. Stalled handlers exceed it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(200);

/// One scripted answer to `GET /{id}`.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    NotFound,
    Status(u16),
}

#[derive(Default)]
struct MockState {
    // The last reply of a script repeats forever.
    scripts: HashMap<String, VecDeque<Reply>>,
    next_id: String,
    reject_creates: bool,
    down: bool,
    created: Vec<Value>,
    fetches: HashMap<String, usize>,
    pings: usize,
}

#[derive(Clone, Default)]
pub struct MockService {
    inner: Arc<Mutex<MockState>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id handed out by the next `POST /create`.
    pub fn assign_id(&self, id: &str) {
        self.lock().next_id = id.to_string();
    }

    pub fn script(&self, id: &str, replies: Vec<Reply>) {
        self.lock().scripts.insert(id.to_string(), replies.into());
    }

    pub fn reject_creates(&self, reject: bool) {
        self.lock().reject_creates = reject;
    }

    /// While down, every request stalls past the client timeout.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    pub fn created(&self) -> Vec<Value> {
        self.lock().created.clone()
    }

    pub fn fetches(&self, id: &str) -> usize {
        self.lock().fetches.get(id).copied().unwrap_or(0)
    }

    pub fn pings(&self) -> usize {
        self.lock().pings
    }

    /// Serves the mock on an ephemeral port and returns its base URL.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/", get(ping))
            .route("/create", post(create))
            .route("/{id}", get(fetch))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    async fn stall_if_down(&self) {
        let down = self.lock().down;
        if down {
            tokio::time::sleep(REQUEST_TIMEOUT * 10).await;
        }
    }
}

async fn ping(State(mock): State<MockService>) -> StatusCode {
    mock.lock().pings += 1;
    mock.stall_if_down().await;
    StatusCode::OK
}

async fn create(State(mock): State<MockService>, Json(body): Json<Value>) -> Response {
    mock.stall_if_down().await;
    let mut state = mock.lock();
    if state.reject_creates {
        return (StatusCode::INTERNAL_SERVER_ERROR, "queue unavailable").into_response();
    }
    state.created.push(body);
    Json(json!({ "id": state.next_id })).into_response()
}

async fn fetch(State(mock): State<MockService>, Path(id): Path<String>) -> Response {
    *mock.lock().fetches.entry(id.clone()).or_default() += 1;
    mock.stall_if_down().await;

    let reply = {
        let mut state = mock.lock();
        match state.scripts.get_mut(&id) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        }
    };

    match reply {
        Some(Reply::Json(body)) => Json(body).into_response(),
        Some(Reply::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Some(Reply::NotFound) | None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn status_reply(status: &str) -> Reply {
    Reply::Json(json!({ "status": status, "created_at": "2024-03-01T10:00:00" }))
}

pub fn completed_reply() -> Reply {
    Reply::Json(json!({
        "status": "completed",
        "output": {
            "pdb_kv": CAVITY_PDB,
            "report": REPORT_TOML,
            "log": RUN_LOG,
        },
        "created_at": "2024-03-01T10:00:00",
        "started_at": "2024-03-01T10:00:02",
        "ended_at": "2024-03-01T10:00:03.5",
    }))
}

/// Intervals short enough for a test to see several cycles.
pub fn fast_settings() -> ReconcileSettings {
    ReconcileSettings {
        poll_interval: Duration::from_millis(50),
        job_delay: Duration::from_millis(10),
        offline_backoff: Duration::from_millis(50),
        liveness_check_every: 3,
    }
}

/// A controller wired to a mock service, with its own jobs and output roots.
pub struct Harness {
    pub dir: TempDir,
    pub mock: MockService,
    pub state: AppState,
    pub controller: JobController,
}

impl Harness {
    pub async fn new(mock: MockService) -> Self {
        Self::with_settings(mock, fast_settings()).await
    }

    pub async fn with_settings(mock: MockService, settings: ReconcileSettings) -> Self {
        let url = mock.spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(
            JobStore::new(dir.path().join("jobs")),
            ServiceClient::new(&url, REQUEST_TIMEOUT).unwrap(),
            ResultExporter::new(),
        );
        let controller = JobController::new(state.clone(), dir.path().join("results"), settings).unwrap();
        Self {
            dir,
            mock,
            state,
            controller,
        }
    }

    pub fn output_dir(&self, id: &str) -> std::path::PathBuf {
        self.dir.path().join("results").join(id)
    }

    /// Consumes events until one matches, panicking after `secs` seconds.
    pub async fn wait_for_event<F>(&mut self, secs: u64, mut matches: F) -> JobEvent
    where
        F: FnMut(&JobEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let event = tokio::time::timeout_at(deadline, self.controller.next_event())
                .await
                .expect("timed out waiting for job event")
                .expect("reconciliation loop stopped");
            if matches(&event) {
                return event;
            }
        }
    }
}

/// Polls `condition` every 20ms, panicking after `secs` seconds.
pub async fn wait_until<F>(secs: u64, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
