//! Client-sequenced task fan-out
//!
//! Unlike the pipeline, the server never chains steps here. The
//! [`FanoutDispatcher`] walks a fixed list of servers itself: for each one it
//! parks a oneshot resolver in a single slot, sends `start_task`, and waits
//! until the matching `task_complete` / `task_error` / `task_cancelled`
//! arrives (or the run is cancelled locally).
//!
//! All mutable state sits behind one mutex that is never held across an
//! `.await`; the resolver slot refuses to be overwritten while occupied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shared_types::{StepStatus, TaskCommand, TaskMessage, TimerState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::connection::{ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::notify::Notifier;
use crate::output_log::OutputLog;
use crate::timer::TimerBank;
use crate::validator::{self, CusnoFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskTarget {
    /// Wire identity (`serverType`)
    pub server_type: u8,
    pub name: &'static str,
}

/// Servers in launch order
pub const TARGETS: [TaskTarget; 3] = [
    TaskTarget {
        server_type: 1,
        name: "wdexpa1p",
    },
    TaskTarget {
        server_type: 2,
        name: "edwap1t",
    },
    TaskTarget {
        server_type: 3,
        name: "mypap1d",
    },
];

fn target_index(server_type: u8) -> Option<usize> {
    TARGETS.iter().position(|t| t.server_type == server_type)
}

fn target_name(server_type: u8) -> &'static str {
    target_index(server_type)
        .map(|i| TARGETS[i].name)
        .unwrap_or("unknown")
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("task lock is held by another client")]
    LockDenied,

    #[error("a task run is already in progress")]
    AlreadyRunning,

    #[error("no customer numbers given")]
    EmptyInput,

    #[error("invalid customer numbers: {}", .0.join(", "))]
    InvalidInput(Vec<String>),

    #[error("a task for server {0} is already outstanding")]
    Occupied(u8),

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("task failed on {server}: {message}")]
    RemoteTask { server: String, message: String },

    #[error("task run cancelled: {0}")]
    Cancelled(String),
}

impl DispatchError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DispatchError::Cancelled(_))
    }
}

impl From<ConnectionError> for DispatchError {
    fn from(_: ConnectionError) -> Self {
        DispatchError::NotConnected
    }
}

#[derive(Debug)]
enum TaskOutcome {
    Completed,
    Cancelled(String),
    Failed(String),
}

struct Outstanding {
    target: u8,
    resolver: oneshot::Sender<TaskOutcome>,
}

struct Inner {
    /// Remote lock mirrored from `task_state_update`
    remote_permits: bool,
    running: bool,
    /// Bumped on every launch and reset
    generation: u64,
    statuses: [StepStatus; 3],
    outstanding: Option<Outstanding>,
    cancel: CancellationToken,
    timers: TimerBank<&'static str>,
    log: OutputLog,
}

impl Inner {
    fn set_status(&mut self, server_type: u8, status: StepStatus) {
        if let Some(i) = target_index(server_type) {
            self.statuses[i] = status;
        }
    }

    /// Take the resolver only if it belongs to `server_type`.
    fn take_matching(&mut self, server_type: u8) -> Option<oneshot::Sender<TaskOutcome>> {
        if self
            .outstanding
            .as_ref()
            .is_some_and(|o| o.target == server_type)
        {
            self.outstanding.take().map(|o| o.resolver)
        } else {
            None
        }
    }
}

/// Read-only view for rendering
#[derive(Debug, Clone)]
pub struct FanoutSnapshot {
    pub statuses: [StepStatus; 3],
    pub running: bool,
    pub remote_permits: bool,
    pub current_target: Option<u8>,
    pub timers: HashMap<&'static str, TimerState>,
    pub logs: Vec<String>,
    pub connection: ConnectionState,
}

/// Clears the single-flight flag and the resolver slot on every exit path.
struct RunGuard {
    inner: Arc<Mutex<Inner>>,
    generation: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation == self.generation {
            inner.running = false;
            inner.outstanding = None;
        }
    }
}

#[derive(Clone)]
pub struct FanoutDispatcher {
    inner: Arc<Mutex<Inner>>,
    connection: Arc<ConnectionManager>,
    notifier: Notifier,
}

impl FanoutDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, notifier: Notifier, log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                remote_permits: true,
                running: false,
                generation: 0,
                statuses: [StepStatus::Idle; 3],
                outstanding: None,
                cancel: CancellationToken::new(),
                timers: TimerBank::new(TARGETS.map(|t| t.name)),
                log: OutputLog::new(log_capacity),
            })),
            connection,
            notifier,
        }
    }

    /// Build a dispatcher with its own connection and start consuming its events.
    pub fn spawn(
        reconnect: ReconnectPolicy,
        notifier: Notifier,
        log_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(reconnect, events_tx));
        let dispatcher = Self::new(connection, notifier, log_capacity);
        let pump = dispatcher.attach(events_rx);
        (dispatcher, pump)
    }

    /// Consume connection events until the channel closes.
    pub fn attach(&self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.handle_event(event);
            }
        })
    }

    pub async fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        self.connection.connect(url).await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("dispatcher lock poisoned")
    }

    /// Run every target in order for `numbers`.
    ///
    /// Resolves once the last server completes. A business failure surfaces as
    /// [`DispatchError::RemoteTask`], an abandoned run as
    /// [`DispatchError::Cancelled`].
    pub async fn launch(&self, numbers: Vec<String>) -> Result<(), DispatchError> {
        let (cusno_list, token, guard) = self.begin(numbers)?;
        let result = self.run_targets(&cusno_list, &token).await;
        drop(guard);

        match &result {
            Ok(()) => {
                self.lock().log.add("[INFO] All task servers completed");
                self.notifier.success("All task servers completed");
            }
            Err(DispatchError::Cancelled(reason)) => {
                self.lock().log.add(format!("[WARNING] Task run cancelled: {reason}"));
                self.notifier.warning("Task run was cancelled");
            }
            Err(e) => {
                self.lock().log.add(format!("[ERROR] {e}"));
                self.notifier.error(e.to_string());
            }
        }
        result
    }

    fn begin(
        &self,
        numbers: Vec<String>,
    ) -> Result<(Vec<String>, CancellationToken, RunGuard), DispatchError> {
        let mut inner = self.lock();
        if !inner.remote_permits {
            drop(inner);
            self.notifier.error("Another client is running tasks");
            return Err(DispatchError::LockDenied);
        }
        if inner.running {
            drop(inner);
            self.notifier.error("A task run is already in progress");
            return Err(DispatchError::AlreadyRunning);
        }

        let raw = numbers.join(",");
        let invalid = CusnoFormat::Legacy.extract_invalid(&raw);
        if !invalid.is_empty() {
            drop(inner);
            self.notifier
                .error(format!("Invalid customer numbers: {}", invalid.join(", ")));
            return Err(DispatchError::InvalidInput(invalid));
        }
        let cusno_list = validator::merge_unique(&[], &CusnoFormat::Legacy.extract_valid(&raw));
        if cusno_list.is_empty() {
            drop(inner);
            self.notifier.error("Enter at least one customer number");
            return Err(DispatchError::EmptyInput);
        }
        if !self.connection.is_open() {
            drop(inner);
            self.notifier.error("WebSocket is not connected");
            return Err(DispatchError::NotConnected);
        }

        inner.running = true;
        inner.generation += 1;
        inner.statuses = [StepStatus::Idle; 3];
        inner.cancel = CancellationToken::new();
        inner.timers.reset_all();
        tracing::info!(customers = cusno_list.len(), "task run started");

        let guard = RunGuard {
            inner: self.inner.clone(),
            generation: inner.generation,
        };
        Ok((cusno_list, inner.cancel.clone(), guard))
    }

    async fn run_targets(
        &self,
        cusno_list: &[String],
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        for target in TARGETS {
            self.execute_task(target, cusno_list, token).await?;
        }
        Ok(())
    }

    async fn execute_task(
        &self,
        target: TaskTarget,
        cusno_list: &[String],
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        if token.is_cancelled() {
            return Err(DispatchError::Cancelled("cancelled by operator".to_string()));
        }

        let resolved = {
            let mut inner = self.lock();
            if inner.outstanding.is_some() {
                return Err(DispatchError::Occupied(target.server_type));
            }
            let (tx, rx) = oneshot::channel();
            inner.outstanding = Some(Outstanding {
                target: target.server_type,
                resolver: tx,
            });
            rx
        };

        let command = TaskCommand::StartTask {
            server_type: target.server_type,
            cusno_list: cusno_list.to_vec(),
        };
        if let Err(e) = self.connection.send(&command) {
            let mut inner = self.lock();
            inner.take_matching(target.server_type);
            inner.set_status(target.server_type, StepStatus::Error);
            return Err(e.into());
        }
        tracing::info!(server = target.name, "start_task sent");

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                let mut inner = self.lock();
                inner.take_matching(target.server_type);
                inner.set_status(target.server_type, StepStatus::Error);
                inner.timers.stop(&target.name);
                TaskOutcome::Cancelled("cancelled by operator".to_string())
            }
            outcome = resolved => {
                outcome.unwrap_or_else(|_| TaskOutcome::Cancelled("run was reset".to_string()))
            }
        };

        match outcome {
            TaskOutcome::Completed => Ok(()),
            TaskOutcome::Cancelled(reason) => Err(DispatchError::Cancelled(reason)),
            TaskOutcome::Failed(message) => Err(DispatchError::RemoteTask {
                server: target.name.to_string(),
                message,
            }),
        }
    }

    /// Abandon the current run. The server is told best-effort.
    pub fn cancel(&self) -> bool {
        let (current, token) = {
            let inner = self.lock();
            if !inner.running {
                return false;
            }
            (
                inner.outstanding.as_ref().map(|o| o.target),
                inner.cancel.clone(),
            )
        };

        if let Some(server_type) = current {
            let command = TaskCommand::TaskCancel {
                server_type,
                cusno_list: None,
            };
            if let Err(e) = self.connection.send(&command) {
                tracing::warn!("task_cancel not delivered: {e}");
            }
        }
        token.cancel();
        true
    }

    /// Drop any run state and zero the timers.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.cancel.cancel();
        inner.generation += 1;
        inner.running = false;
        inner.outstanding = None;
        inner.statuses = [StepStatus::Idle; 3];
        inner.timers.terminate_all();
    }

    pub fn snapshot(&self) -> FanoutSnapshot {
        let inner = self.lock();
        FanoutSnapshot {
            statuses: inner.statuses,
            running: inner.running,
            remote_permits: inner.remote_permits,
            current_target: inner.outstanding.as_ref().map(|o| o.target),
            timers: inner.timers.snapshot(),
            logs: inner.log.lines(),
            connection: self.connection.state(),
        }
    }

    pub fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => tracing::debug!("task socket open"),
            ConnectionEvent::Message(text) => {
                tracing::debug!(frame = %text, "inbound frame");
                match serde_json::from_str::<TaskMessage>(&text) {
                    Ok(message) => self.handle_message(message),
                    Err(e) => tracing::warn!("failed to parse task message: {e}"),
                }
            }
            ConnectionEvent::Closed { code, abnormal } => {
                tracing::info!(?code, abnormal, "task socket closed");
                let mut inner = self.lock();
                let resolver = inner.outstanding.take();
                if let Some(o) = resolver {
                    inner.set_status(o.target, StepStatus::Error);
                    inner.timers.stop(&target_name(o.target));
                    let _ = o
                        .resolver
                        .send(TaskOutcome::Cancelled("connection lost".to_string()));
                }
            }
            ConnectionEvent::Reconnecting { attempt, max } => {
                self.notifier
                    .info(format!("Reconnecting... ({attempt}/{max})"));
            }
            ConnectionEvent::ReconnectExhausted => {
                self.notifier
                    .error("WebSocket reconnection failed. Restart the client.");
            }
        }
    }

    pub fn handle_message(&self, message: TaskMessage) {
        let mut inner = self.lock();
        match message {
            TaskMessage::TaskStateUpdate { state } => {
                tracing::info!(permitted = state, "remote task lock updated");
                inner.remote_permits = state;
            }
            TaskMessage::TaskStart { server_type } => {
                let outstanding = inner
                    .outstanding
                    .as_ref()
                    .is_some_and(|o| o.target == server_type);
                let idle = target_index(server_type)
                    .is_some_and(|i| inner.statuses[i] == StepStatus::Idle);
                if inner.running && outstanding && idle {
                    inner.set_status(server_type, StepStatus::Running);
                    inner.timers.start(&target_name(server_type));
                } else {
                    tracing::debug!(server_type, "ignoring task_start outside the outstanding task");
                }
            }
            TaskMessage::TaskComplete { server_type } => {
                if let Some(resolver) = inner.take_matching(server_type) {
                    inner.set_status(server_type, StepStatus::Success);
                    inner.timers.stop(&target_name(server_type));
                    inner
                        .log
                        .add(format!("[COMPLETE] {} finished", target_name(server_type)));
                    let _ = resolver.send(TaskOutcome::Completed);
                } else {
                    tracing::debug!(server_type, "ignoring task_complete for non-outstanding target");
                }
            }
            TaskMessage::TaskCancelled { server_type } => {
                if let Some(resolver) = inner.take_matching(server_type) {
                    inner.set_status(server_type, StepStatus::Error);
                    inner.timers.stop(&target_name(server_type));
                    let _ = resolver.send(TaskOutcome::Cancelled(format!(
                        "{} cancelled by server",
                        target_name(server_type)
                    )));
                }
            }
            TaskMessage::TaskError {
                server_type,
                message,
            } => {
                if let Some(resolver) = inner.take_matching(server_type) {
                    inner.set_status(server_type, StepStatus::Error);
                    inner.timers.stop(&target_name(server_type));
                    let _ = resolver.send(TaskOutcome::Failed(
                        message.unwrap_or_else(|| "Unknown error".to_string()),
                    ));
                }
            }
            TaskMessage::TaskLog { server_type, value } => {
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    inner
                        .log
                        .add(format!("[{}] {value}", target_name(server_type)));
                }
            }
            TaskMessage::Unknown => tracing::warn!("ignoring unknown task message type"),
        }
    }
}
