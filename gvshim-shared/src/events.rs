//! Task events published to the orchestrating daemon.

use crate::constants::topics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Mount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIo {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreate {
    pub container_id: String,
    pub bundle: String,
    pub rootfs: Vec<Mount>,
    pub io: TaskIo,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStart {
    pub container_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOom {
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExit {
    pub container_id: String,
    pub id: String,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDelete {
    pub container_id: String,
    pub id: String,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecAdded {
    pub container_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecStarted {
    pub container_id: String,
    pub exec_id: String,
    pub pid: u32,
}

/// Event emitted by the shim.
///
/// Events received from elsewhere with a kind this shim does not know
/// decode as [`TaskEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreate(TaskCreate),
    TaskStart(TaskStart),
    TaskOom(TaskOom),
    TaskExit(TaskExit),
    TaskDelete(TaskDelete),
    TaskExecAdded(TaskExecAdded),
    TaskExecStarted(TaskExecStarted),
    #[serde(other)]
    Unknown,
}

impl TaskEvent {
    /// Topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            TaskEvent::TaskCreate(_) => topics::TASK_CREATE,
            TaskEvent::TaskStart(_) => topics::TASK_START,
            TaskEvent::TaskOom(_) => topics::TASK_OOM,
            TaskEvent::TaskExit(_) => topics::TASK_EXIT,
            TaskEvent::TaskDelete(_) => topics::TASK_DELETE,
            TaskEvent::TaskExecAdded(_) => topics::TASK_EXEC_ADDED,
            TaskEvent::TaskExecStarted(_) => topics::TASK_EXEC_STARTED,
            TaskEvent::Unknown => topics::TASK_UNKNOWN,
        }
    }

    /// Container the event refers to, if it names one.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            TaskEvent::TaskCreate(e) => Some(&e.container_id),
            TaskEvent::TaskStart(e) => Some(&e.container_id),
            TaskEvent::TaskOom(e) => Some(&e.container_id),
            TaskEvent::TaskExit(e) => Some(&e.container_id),
            TaskEvent::TaskDelete(e) => Some(&e.container_id),
            TaskEvent::TaskExecAdded(e) => Some(&e.container_id),
            TaskEvent::TaskExecStarted(e) => Some(&e.container_id),
            TaskEvent::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_follow_event_kind() {
        let exit = TaskEvent::TaskExit(TaskExit {
            container_id: "c1".into(),
            id: "c1".into(),
            pid: 42,
            exit_status: 137,
            exited_at: Utc::now(),
        });
        assert_eq!(exit.topic(), "/tasks/exit");
        assert_eq!(exit.container_id(), Some("c1"));

        let added = TaskEvent::TaskExecAdded(TaskExecAdded {
            container_id: "c1".into(),
            exec_id: "e1".into(),
        });
        assert_eq!(added.topic(), "/tasks/exec-added");

        let oom = TaskEvent::TaskOom(TaskOom {
            container_id: "c1".into(),
        });
        assert_eq!(oom.topic(), "/tasks/oom");
    }

    #[test]
    fn test_unrecognized_kind_decodes_as_unknown() {
        let event: TaskEvent =
            serde_json::from_str(r#"{"kind":"task_checkpointed","container_id":"c1"}"#).unwrap();
        assert_eq!(event, TaskEvent::Unknown);
        assert_eq!(event.topic(), "/tasks/?");
        assert_eq!(event.container_id(), None);
    }
}
