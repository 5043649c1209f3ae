//! Wire types of the KVFinder-web HTTP contract.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::JobStatus;
use crate::models::settings::Settings;

/// Body of `POST {server}/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub settings: Settings,
    /// Structure file as a list of lines, newlines kept.
    pub pdb: Vec<String>,
    pub pdb_ligand: Option<Vec<String>>,
}

impl CreateJobRequest {
    pub fn new(settings: Settings, pdb: &str, ligand: Option<&str>) -> Self {
        Self {
            settings,
            pdb: split_lines(pdb),
            pdb_ligand: ligand.map(split_lines),
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobReply {
    pub id: String,
}

/// Files produced by parKVFinder for a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Cavity structure in PDB format.
    pub pdb_kv: String,
    /// parKVFinder results file (TOML).
    pub report: String,
    pub log: String,
}

/// Body of `GET {server}/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReply {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The part of a finished reply worth keeping: output plus timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePayload {
    pub output: JobOutput,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durations derived from the service timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobTimings {
    pub queued: Option<Duration>,
    pub running: Option<Duration>,
    pub total: Option<Duration>,
}

impl JobStatusReply {
    /// Splits off the payload of a finished job. `None` if the job has no
    /// results yet or the service omitted the output block.
    pub fn into_payload(self) -> Option<RemotePayload> {
        if !self.status.has_results() {
            return None;
        }
        Some(RemotePayload {
            output: self.output?,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

impl RemotePayload {
    pub fn timings(&self) -> JobTimings {
        let between = |from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>| Some(to? - from?);
        JobTimings {
            queued: between(self.created_at, self.started_at),
            running: between(self.started_at, self.ended_at),
            total: between(self.created_at, self.ended_at),
        }
    }
}

/// RFC 3339 timestamps, also accepting the offset-less form the job queue emits (read as UTC).
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_keeps_line_endings() {
        let request = CreateJobRequest::new(Settings::default(), "ATOM 1\nATOM 2\nEND", None);
        assert_eq!(request.pdb, vec!["ATOM 1\n", "ATOM 2\n", "END"]);
        assert!(request.pdb_ligand.is_none());

        let body = serde_json::to_value(&request).unwrap();
        assert!(body["pdb_ligand"].is_null());
        assert_eq!(body["settings"]["probes"]["probe_out"], 4.0);
    }

    #[test]
    fn test_running_reply_has_no_payload() {
        let reply: JobStatusReply = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(reply.status, JobStatus::Running);
        assert!(reply.into_payload().is_none());
    }

    #[test]
    fn test_completed_reply_payload_and_timings() {
        let reply: JobStatusReply = serde_json::from_value(serde_json::json!({
            "id": "42",
            "status": "completed",
            "output": {"pdb_kv": "ATOM", "report": "x = 1", "log": "done"},
            "created_at": "2020-05-06T18:54:40.000000",
            "started_at": "2020-05-06T18:54:46Z",
            "ended_at": "2020-05-06T18:55:16+00:00",
            "expires_after": "1d"
        }))
        .unwrap();

        let payload = reply.into_payload().unwrap();
        let timings = payload.timings();
        assert_eq!(timings.queued, Some(Duration::seconds(6)));
        assert_eq!(timings.running, Some(Duration::seconds(30)));
        assert_eq!(timings.total, Some(Duration::seconds(36)));
    }

    #[test]
    fn test_completed_reply_without_output() {
        let reply: JobStatusReply = serde_json::from_str(r#"{"status":"timed_out"}"#).unwrap();
        assert!(reply.into_payload().is_none());
    }
}
