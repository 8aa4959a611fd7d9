//! Inbound write tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Start,
    Stop,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteStatus {
    #[default]
    NotExecuted,
    Cancelled,
    Error,
    Completed,
}

/// One request to set a point's value on a device.
///
/// `value` is kept as text; the driver parses it into the point's native type
/// and treats a parse failure as a failed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteTask {
    #[serde(default = "new_task_id")]
    pub id: String,
    pub protocol_id: String,
    pub equipment_id: String,
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub kind: WriteKind,
    #[serde(default)]
    pub status: WriteStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl WriteTask {
    pub fn new(
        protocol_id: impl Into<String>,
        equipment_id: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: new_task_id(),
            protocol_id: protocol_id.into(),
            equipment_id: equipment_id.into(),
            label: label.into(),
            value: value.into(),
            kind: WriteKind::Other,
            status: WriteStatus::NotExecuted,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_kind(mut self, kind: WriteKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != WriteStatus::NotExecuted
    }

    pub fn complete(&mut self) {
        self.finish(WriteStatus::Completed, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(WriteStatus::Error, Some(error.into()));
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.finish(WriteStatus::Cancelled, Some(reason.into()));
    }

    fn finish(&mut self, status: WriteStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}
