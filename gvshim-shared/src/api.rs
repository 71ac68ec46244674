//! Task-control protocol messages.
//!
//! One request/response pair per operation, plus the NDJSON framing used on
//! the control socket.

use crate::errors::{ErrorKind, ShimError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single rootfs mount, applied in list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTaskRequest {
    pub id: String,
    pub bundle: String,
    pub runtime: String,
    pub rootfs: Vec<Mount>,
    pub terminal: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// Runtime-specific options, decoded by the process factory.
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteProcessRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecProcessRequest {
    pub id: String,
    pub terminal: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// OCI process spec for the new process.
    pub spec: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResizePtyRequest {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRequest {
    pub id: String,
}

/// Task status as reported on the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
}

impl TaskStatus {
    /// Map the sandbox runtime's status vocabulary onto the protocol.
    ///
    /// Anything unrecognized is [`TaskStatus::Unknown`].
    pub fn from_runtime(status: &str) -> Self {
        match status {
            "created" => TaskStatus::Created,
            "running" => TaskStatus::Running,
            "stopped" => TaskStatus::Stopped,
            _ => TaskStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KillRequest {
    /// Empty targets the init process.
    pub id: String,
    pub signal: u32,
    pub all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPidsRequest {
    pub id: String,
}

/// Extra details for a pid that matches a tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub exec_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub info: Option<ProcessDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPidsResponse {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseIoRequest {
    pub id: String,
    pub stdin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimInfoResponse {
    pub shim_pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointTaskRequest {
    pub path: String,
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateTaskRequest {
    pub resources: Option<serde_json::Value>,
}

/// Every operation of the task-control protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum TaskRequest {
    Create(CreateTaskRequest),
    Start(StartRequest),
    Delete,
    DeleteProcess(DeleteProcessRequest),
    Exec(ExecProcessRequest),
    ResizePty(ResizePtyRequest),
    State(StateRequest),
    Pause,
    Resume,
    Kill(KillRequest),
    ListPids(ListPidsRequest),
    CloseIo(CloseIoRequest),
    Checkpoint(CheckpointTaskRequest),
    ShimInfo,
    Update(UpdateTaskRequest),
    Wait(WaitRequest),
}

impl TaskRequest {
    /// Short label for logs.
    pub fn method(&self) -> &'static str {
        match self {
            TaskRequest::Create(_) => "create",
            TaskRequest::Start(_) => "start",
            TaskRequest::Delete => "delete",
            TaskRequest::DeleteProcess(_) => "delete_process",
            TaskRequest::Exec(_) => "exec",
            TaskRequest::ResizePty(_) => "resize_pty",
            TaskRequest::State(_) => "state",
            TaskRequest::Pause => "pause",
            TaskRequest::Resume => "resume",
            TaskRequest::Kill(_) => "kill",
            TaskRequest::ListPids(_) => "list_pids",
            TaskRequest::CloseIo(_) => "close_io",
            TaskRequest::Checkpoint(_) => "checkpoint",
            TaskRequest::ShimInfo => "shim_info",
            TaskRequest::Update(_) => "update",
            TaskRequest::Wait(_) => "wait",
        }
    }
}

/// One request line on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl RequestFrame {
    pub fn new(id: u64, request: &TaskRequest) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(request)?;
        let params = value
            .get_mut("params")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        Ok(Self {
            id,
            method: request.method().to_string(),
            params,
        })
    }

    /// Decode the typed request carried by this frame.
    pub fn request(&self) -> Result<TaskRequest, ShimError> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("method".into(), self.method.clone().into());
        if !self.params.is_null() {
            envelope.insert("params".into(), self.params.clone());
        }
        serde_json::from_value(serde_json::Value::Object(envelope)).map_err(|e| {
            ShimError::InvalidArgument(format!("malformed '{}' request: {}", self.method, e))
        })
    }
}

/// Error payload of a response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// gRPC status code
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ShimError> for WireError {
    fn from(err: &ShimError) -> Self {
        Self {
            code: err.code() as i32,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One response line on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseFrame {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, err: &ShimError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }
}
