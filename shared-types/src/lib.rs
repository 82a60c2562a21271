//! Shared types between the batch orchestrator and its collaborators
//!
//! These types are used by:
//! - the WebSocket protocol spoken with the batch server (pipeline and task variants)
//! - the load-history REST API
//! - snapshots handed to whatever UI renders progress
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Steps and Timers
// ============================================================================

/// Status of one unit of work inside a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

impl StepStatus {
    /// Whether `next` is a legal forward transition within a single run.
    ///
    /// Resetting back to `Idle` is not a transition; it only happens when a
    /// run is discarded.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Idle, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Success)
                | (StepStatus::Running, StepStatus::Error)
        )
    }
}

/// Elapsed time as displayed to operators: zero-padded minutes, seconds and
/// hundredths of a second.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerState {
    pub min: String,
    pub sec: String,
    pub msec: String,
}

impl TimerState {
    pub fn zero() -> Self {
        Self::from_elapsed(Duration::ZERO)
    }

    pub fn from_elapsed(elapsed: Duration) -> Self {
        let centis = elapsed.as_millis() / 10;
        let min = centis / 6000;
        let sec = (centis / 100) % 60;
        let msec = centis % 100;
        Self {
            min: format!("{min:02}"),
            sec: format!("{sec:02}"),
            msec: format!("{msec:02}"),
        }
    }
}

impl Default for TimerState {
    fn default() -> Self {
        Self::zero()
    }
}

// ============================================================================
// Session and Server Health
// ============================================================================

/// Remote execution lock as mirrored locally
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub active: bool,
    pub owner: Option<String>,
}

impl SessionStatus {
    /// The local client may act when nobody holds the lock or it holds it itself.
    pub fn permits(&self, identity: Option<&str>) -> bool {
        if !self.active {
            return true;
        }
        match (self.owner.as_deref(), identity) {
            (Some(owner), Some(me)) => owner == me,
            _ => false,
        }
    }
}

/// Health of one backend worker server, pushed by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerHealth {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub host: String,
    pub is_healthy: bool,
    #[serde(default)]
    pub last_checked: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
}

/// Session fields carried by `session_started`, `session_ended` and `session_status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionUpdate {
    #[serde(default)]
    pub session_active: bool,
    #[serde(default)]
    pub session_owner: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SessionUpdate {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            active: self.session_active,
            owner: self.session_owner.clone(),
        }
    }
}

// ============================================================================
// Pipeline Protocol
// ============================================================================

/// Server → Client messages of the pipeline workflow socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after the socket opens
    Welcome {
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        session_active: bool,
        #[serde(default)]
        session_owner: Option<String>,
        #[serde(default)]
        server_health: Option<HashMap<String, ServerHealth>>,
    },
    SessionStarted(SessionUpdate),
    SessionEnded(SessionUpdate),
    SessionStatus(SessionUpdate),
    /// Health change for a single server
    #[serde(rename = "server_health")]
    ServerHealthUpdate {
        server_name: String,
        #[serde(default)]
        is_healthy: bool,
        status: ServerHealth,
    },
    /// Raw command output
    Output {
        #[serde(default)]
        data: Option<String>,
    },
    Status {
        #[serde(default)]
        message: Option<String>,
    },
    /// The currently running step finished
    Complete {
        #[serde(default)]
        message: Option<String>,
    },
    /// The currently running step failed
    Error {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Human readable error text, `detail` preferred over `message`.
    pub fn error_text(detail: Option<&str>, message: Option<&str>) -> String {
        detail
            .filter(|d| !d.is_empty())
            .or(message.filter(|m| !m.is_empty()))
            .unwrap_or("Unknown error")
            .to_string()
    }
}

/// Client → Server commands of the pipeline workflow socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    StartSession,
    EndSession,
    SshCommand {
        server: String,
        command: String,
        throttle_interval: f64,
    },
    ScpTransfer {
        transfer_name: String,
    },
}

// ============================================================================
// Task (fan-out) Protocol
// ============================================================================

/// Server → Client messages of the task socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TaskMessage {
    /// Remote lock: `true` when this client may launch
    TaskStateUpdate { state: bool },
    TaskStart { server_type: u8 },
    TaskComplete { server_type: u8 },
    TaskCancelled { server_type: u8 },
    TaskError {
        server_type: u8,
        #[serde(default)]
        message: Option<String>,
    },
    TaskLog {
        server_type: u8,
        #[serde(default)]
        value: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl TaskMessage {
    pub fn server_type(&self) -> Option<u8> {
        match self {
            TaskMessage::TaskStart { server_type }
            | TaskMessage::TaskComplete { server_type }
            | TaskMessage::TaskCancelled { server_type }
            | TaskMessage::TaskError { server_type, .. }
            | TaskMessage::TaskLog { server_type, .. } => Some(*server_type),
            TaskMessage::TaskStateUpdate { .. } | TaskMessage::Unknown => None,
        }
    }
}

/// Client → Server commands of the task socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TaskCommand {
    StartTask {
        server_type: u8,
        cusno_list: Vec<String>,
    },
    TaskCancel {
        server_type: u8,
        cusno_list: Option<Vec<String>>,
    },
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToastTone {
    Info,
    Success,
    Warning,
    Error,
}

/// User-facing notification handed to the toast collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToastPayload {
    pub tone: ToastTone,
    pub message: String,
}

// ============================================================================
// Load History REST API
// ============================================================================

/// Request to record a completed run, one row per customer number server-side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryCreateRequest {
    pub batch_id: String,
    pub customer_numbers: Vec<String>,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub execution_time_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryCreateResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub batch_id: String,
    pub inserted_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryResponse {
    pub id: i64,
    pub batch_id: String,
    pub customer_number: String,
    pub client_ip: String,
    pub connection_id: Option<String>,
    pub execution_time_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryListResponse {
    pub total: u64,
    pub items: Vec<LoadHistoryResponse>,
}

/// Filters for listing histories; absent fields are not sent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoadHistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummaryResponse {
    pub batch_id: String,
    pub total_customers: u64,
    pub client_ip: String,
    pub execution_time_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryNoteUpdateRequest {
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryNoteUpdateResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub history_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadHistoryDeleteResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub deleted_count: u64,
    pub retention_days: u32,
}
