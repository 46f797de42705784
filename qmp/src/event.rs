use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Asynchronous notification pushed by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// Job states reported by `JOB_STATUS_CHANGE` and `query-jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Undefined,
    Created,
    Running,
    Paused,
    Ready,
    Standby,
    Waiting,
    Pending,
    Aborting,
    Concluded,
    Null,
}

pub const JOB_STATUS_CHANGE: &str = "JOB_STATUS_CHANGE";

impl Event {
    pub fn job_status_change(job_id: &str, status: JobStatus) -> Self {
        Self {
            event: JOB_STATUS_CHANGE.to_string(),
            data: serde_json::json!({ "id": job_id, "status": status }),
            timestamp: None,
        }
    }

    /// `(job id, status)` when this is a `JOB_STATUS_CHANGE` event.
    pub fn job_status(&self) -> Option<(&str, JobStatus)> {
        if self.event != JOB_STATUS_CHANGE {
            return None;
        }
        let id = self.data.get("id")?.as_str()?;
        let status = JobStatus::deserialize(self.data.get("status")?).ok()?;
        Some((id, status))
    }
}

/// Events received after the subscription was taken.
pub type EventStream = BoxStream<'static, Event>;
