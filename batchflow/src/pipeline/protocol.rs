//! PipelineActor message protocol

use std::collections::HashMap;

use ractor::RpcReplyPort;
use shared_types::{ServerHealth, SessionStatus, StepStatus, TimerState};

use super::state::{Phase, Step};
use crate::connection::{ConnectionEvent, ConnectionState};

#[derive(Debug)]
pub enum PipelineMsg {
    /// Begin a run for the given raw customer numbers
    Start {
        numbers: Vec<String>,
        reply: RpcReplyPort<Result<(), PipelineError>>,
    },
    /// Operator abandons the running workflow
    Cancel {
        reply: RpcReplyPort<Result<(), PipelineError>>,
    },
    Reset {
        reply: RpcReplyPort<()>,
    },
    GetSnapshot {
        reply: RpcReplyPort<PipelineSnapshot>,
    },
    /// Forwarded from the connection manager
    Connection(ConnectionEvent),
    /// Watchdog deadline for a step dispatched in run `run_id`
    StepDeadline { run_id: u64, step: Step },
    /// Result of a background history submission
    HistoryRecorded(Result<u64, String>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("session is held by another client")]
    LockDenied,

    #[error("a workflow is already running")]
    AlreadyRunning,

    #[error("previous run failed; reset before starting again")]
    NeedsReset,

    #[error("no customer numbers given")]
    EmptyInput,

    #[error("invalid customer numbers: {}", .0.join(", "))]
    InvalidInput(Vec<String>),

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("no workflow is running")]
    NotRunning,

    #[error("pipeline actor unavailable: {0}")]
    Actor(String),
}

/// Read-only view of the orchestrator for rendering
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub steps: [StepStatus; 3],
    pub running: bool,
    pub last_error: Option<String>,
    pub batch_id: Option<String>,
    pub customer_numbers: Vec<String>,
    pub timers: HashMap<Phase, TimerState>,
    pub logs: Vec<String>,
    pub session: SessionStatus,
    pub connection_id: Option<String>,
    pub can_act: bool,
    pub connection: ConnectionState,
    pub server_health: HashMap<String, ServerHealth>,
}

impl PipelineSnapshot {
    pub fn status(&self, step: Step) -> StepStatus {
        self.steps[step.index()]
    }

    pub fn timer(&self, phase: Phase) -> TimerState {
        self.timers.get(&phase).cloned().unwrap_or_default()
    }
}
