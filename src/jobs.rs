use std::{collections::HashMap, fmt};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::model::ModelKey;

/// Opaque task identifier handed to callers at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: JobId,
    pub status: JobStatus,
    pub model: ModelKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocals_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accompaniment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State change applied by the orchestrator.
#[derive(Debug, Clone)]
pub enum Transition {
    Processing,
    Completed {
        vocals_url: String,
        accompaniment_url: String,
    },
    Failed {
        error: String,
    },
}

impl Transition {
    fn target(&self) -> JobStatus {
        match self {
            Transition::Processing => JobStatus::Processing,
            Transition::Completed { .. } => JobStatus::Completed,
            Transition::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// In-memory table of task records. Records are never removed.
#[derive(Default)]
pub struct JobRegistry {
    tasks: RwLock<HashMap<JobId, TaskRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending record. Ids are generated internally, so a
    /// duplicate is a bug in the caller.
    pub fn create(&self, task_id: JobId, model: ModelKey) -> TaskRecord {
        let record = TaskRecord {
            task_id,
            status: JobStatus::Pending,
            model,
            vocals_url: None,
            accompaniment_url: None,
            error: None,
        };
        let previous = self.tasks.write().insert(task_id, record.clone());
        debug_assert!(previous.is_none(), "duplicate task id {task_id}");
        record
    }

    /// Applies `transition` when it follows the pending → processing →
    /// terminal order. Returns `false` and leaves the record untouched
    /// otherwise.
    pub fn transition(&self, task_id: JobId, transition: Transition) -> bool {
        let mut tasks = self.tasks.write();
        let Some(record) = tasks.get_mut(&task_id) else {
            warn!(%task_id, "transition for unknown task");
            return false;
        };

        let target = transition.target();
        let allowed = matches!(
            (record.status, target),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !allowed {
            warn!(%task_id, from = ?record.status, to = ?target, "rejected task transition");
            return false;
        }

        record.status = target;
        match transition {
            Transition::Processing => {}
            Transition::Completed {
                vocals_url,
                accompaniment_url,
            } => {
                record.vocals_url = Some(vocals_url);
                record.accompaniment_url = Some(accompaniment_url);
            }
            Transition::Failed { error } => record.error = Some(error),
        }
        true
    }

    pub fn get(&self, task_id: JobId) -> Option<TaskRecord> {
        self.tasks.read().get(&task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
