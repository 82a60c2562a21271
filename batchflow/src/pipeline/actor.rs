//! PipelineActor - drives extract → transfer → load over one socket
//!
//! The actor is the single owner of all workflow state. Inbound socket frames,
//! operator commands and watchdog deadlines all arrive as [`PipelineMsg`]s and
//! are handled one at a time, so no two step transitions are ever in flight.
//! Transitions themselves are decided by [`reduce`]; this file only executes
//! the resulting effects.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use shared_types::{ClientCommand, ServerHealth, ServerMessage, ToastTone};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{PipelineError, PipelineMsg, PipelineSnapshot};
use super::state::{reduce, Effect, Phase, PipelineEvent, RunInfo, Step, WorkflowState};
use crate::config::StepPlan;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::history::{CompletedRun, HistoryRecorder};
use crate::notify::Notifier;
use crate::output_log::OutputLog;
use crate::session::SessionArbiter;
use crate::timer::TimerBank;
use crate::validator::{self, CusnoFormat};

#[derive(Debug, Default)]
pub struct PipelineActor;

pub struct PipelineArguments {
    pub connection: Arc<ConnectionManager>,
    /// Receiving half of the channel given to `connection`
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub plan: StepPlan,
    /// Disabled when `None`; completed runs are then only logged
    pub recorder: Option<HistoryRecorder>,
    pub notifier: Notifier,
    pub step_timeout: Option<Duration>,
    pub log_capacity: usize,
}

pub struct PipelineState {
    workflow: WorkflowState,
    plan: StepPlan,
    connection: Arc<ConnectionManager>,
    arbiter: SessionArbiter,
    timers: TimerBank<Phase>,
    log: OutputLog,
    server_health: HashMap<String, ServerHealth>,
    notifier: Notifier,
    recorder: Option<HistoryRecorder>,
    step_timeout: Option<Duration>,
    next_run_id: u64,
    event_pump: JoinHandle<()>,
}

#[async_trait]
impl Actor for PipelineActor {
    type Msg = PipelineMsg;
    type State = PipelineState;
    type Arguments = PipelineArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "PipelineActor starting");

        let mut events = args.events;
        let pump_ref = myself.clone();
        let event_pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if pump_ref.cast(PipelineMsg::Connection(event)).is_err() {
                    break;
                }
            }
        });

        Ok(PipelineState {
            workflow: WorkflowState::default(),
            plan: args.plan,
            connection: args.connection,
            arbiter: SessionArbiter::new(),
            timers: TimerBank::new(Phase::ALL),
            log: OutputLog::new(args.log_capacity),
            server_health: HashMap::new(),
            notifier: args.notifier,
            recorder: args.recorder,
            step_timeout: args.step_timeout,
            next_run_id: 1,
            event_pump,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PipelineMsg::Start { numbers, reply } => {
                let result = self.handle_start(&myself, state, numbers);
                let _ = reply.send(result);
            }
            PipelineMsg::Cancel { reply } => {
                let result = if state.workflow.running {
                    self.apply(&myself, state, PipelineEvent::Cancelled);
                    Ok(())
                } else {
                    Err(PipelineError::NotRunning)
                };
                let _ = reply.send(result);
            }
            PipelineMsg::Reset { reply } => {
                self.apply(&myself, state, PipelineEvent::Reset);
                let _ = reply.send(());
            }
            PipelineMsg::GetSnapshot { reply } => {
                let _ = reply.send(snapshot(state));
            }
            PipelineMsg::Connection(event) => {
                self.handle_connection_event(&myself, state, event);
            }
            PipelineMsg::StepDeadline { run_id, step } => {
                self.apply(&myself, state, PipelineEvent::StepTimedOut { run_id, step });
            }
            PipelineMsg::HistoryRecorded(result) => {
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "load history not recorded");
                }
                state.log.add(HistoryRecorder::outcome_line(&result));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.event_pump.abort();
        state.timers.terminate_all();
        tracing::info!(actor_id = %myself.get_id(), "PipelineActor stopped");
        Ok(())
    }
}

impl PipelineActor {
    fn handle_start(
        &self,
        myself: &ActorRef<PipelineMsg>,
        state: &mut PipelineState,
        numbers: Vec<String>,
    ) -> Result<(), PipelineError> {
        if !state.arbiter.can_act() {
            state
                .notifier
                .error("Another client is running a workflow. Please wait.");
            return Err(PipelineError::LockDenied);
        }
        if state.workflow.running {
            state.notifier.warning("A workflow is already running");
            return Err(PipelineError::AlreadyRunning);
        }
        if state.workflow.needs_reset() {
            state
                .notifier
                .warning("The previous run failed. Reset before starting again.");
            return Err(PipelineError::NeedsReset);
        }

        let raw = numbers.join(",");
        let invalid = CusnoFormat::Standard.extract_invalid(&raw);
        if !invalid.is_empty() {
            state
                .notifier
                .error(format!("Invalid customer numbers: {}", invalid.join(", ")));
            return Err(PipelineError::InvalidInput(invalid));
        }
        let customer_numbers = validator::merge_unique(&[], &CusnoFormat::Standard.extract_valid(&raw));
        if customer_numbers.is_empty() {
            state.notifier.warning("Enter at least one customer number");
            return Err(PipelineError::EmptyInput);
        }

        if !state.connection.is_open() {
            state.notifier.error("WebSocket is not connected");
            return Err(PipelineError::NotConnected);
        }

        let run = RunInfo {
            run_id: state.next_run_id,
            batch_id: uuid::Uuid::new_v4().to_string(),
            customer_numbers,
            started_at: Utc::now(),
        };
        state.next_run_id += 1;
        tracing::info!(
            batch_id = %run.batch_id,
            customers = run.customer_numbers.len(),
            "starting pipeline run"
        );
        self.apply(myself, state, PipelineEvent::Start(run));
        Ok(())
    }

    fn handle_connection_event(
        &self,
        myself: &ActorRef<PipelineMsg>,
        state: &mut PipelineState,
        event: ConnectionEvent,
    ) {
        match event {
            ConnectionEvent::Opened => {
                tracing::debug!("pipeline socket open, waiting for welcome");
            }
            ConnectionEvent::Message(text) => {
                tracing::debug!(frame = %text, "inbound frame");
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => self.handle_server_message(myself, state, message),
                    Err(e) => tracing::warn!("failed to parse server message: {e}"),
                }
            }
            ConnectionEvent::Closed { code, abnormal } => {
                tracing::info!(?code, abnormal, "pipeline socket closed");
                self.apply(myself, state, PipelineEvent::ConnectionLost);
            }
            ConnectionEvent::Reconnecting { attempt, max } => {
                state
                    .notifier
                    .info(format!("Reconnecting... ({attempt}/{max})"));
            }
            ConnectionEvent::ReconnectExhausted => {
                state
                    .notifier
                    .error("WebSocket reconnection failed. Restart the client.");
            }
        }
    }

    fn handle_server_message(
        &self,
        myself: &ActorRef<PipelineMsg>,
        state: &mut PipelineState,
        message: ServerMessage,
    ) {
        if state.arbiter.apply(&message) {
            if let ServerMessage::Welcome { server_health, .. } = &message {
                if let Some(health) = server_health {
                    state.server_health = health.clone();
                }
                state.notifier.success("WebSocket connected");
            }
            return;
        }

        match message {
            ServerMessage::ServerHealthUpdate {
                server_name,
                is_healthy,
                status,
            } => {
                let (tone, text) = if is_healthy {
                    (ToastTone::Info, "healthy")
                } else {
                    (ToastTone::Warning, "down")
                };
                state
                    .notifier
                    .notify(tone, format!("Server {server_name} is {text}"));
                state.server_health.insert(server_name, status);
            }
            ServerMessage::Output { data } => {
                if let Some(data) = data.filter(|d| !d.is_empty()) {
                    state.log.add(data);
                }
            }
            ServerMessage::Status { message } => {
                if let Some(message) = message.filter(|m| !m.is_empty()) {
                    state.log.add(format!("[STATUS] {message}"));
                }
            }
            ServerMessage::Complete { message } => {
                self.apply(myself, state, PipelineEvent::Complete { message });
            }
            ServerMessage::Error { detail, message } => {
                let text = ServerMessage::error_text(detail.as_deref(), message.as_deref());
                self.apply(myself, state, PipelineEvent::Failed { text });
            }
            ServerMessage::Unknown => {
                tracing::warn!("ignoring unknown server message type");
            }
            ServerMessage::Welcome { .. }
            | ServerMessage::SessionStarted(_)
            | ServerMessage::SessionEnded(_)
            | ServerMessage::SessionStatus(_) => {}
        }
    }

    /// Feed `event` through the reducer and carry out every effect.
    fn apply(&self, myself: &ActorRef<PipelineMsg>, state: &mut PipelineState, event: PipelineEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let before = state.workflow.steps;
            let (next, effects) = reduce(&state.workflow, event);
            state.workflow = next;
            if before != state.workflow.steps {
                tracing::info!(from = ?before, to = ?state.workflow.steps, "workflow transition");
            }
            for effect in effects {
                if let Some(follow_up) = self.execute(myself, state, effect) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    fn execute(
        &self,
        myself: &ActorRef<PipelineMsg>,
        state: &mut PipelineState,
        effect: Effect,
    ) -> Option<PipelineEvent> {
        match effect {
            Effect::RequestSession => {
                if let Err(e) = state.arbiter.request_start(&state.connection) {
                    state.log.add(format!("[ERROR] Session request failed: {e}"));
                }
            }
            Effect::Dispatch(step) => return self.dispatch(myself, state, step),
            Effect::StartTimer(phase) => state.timers.start(&phase),
            Effect::StopTimer(phase) => state.timers.stop(&phase),
            Effect::TerminateTimers => state.timers.terminate_all(),
            Effect::RecordHistory => record_history(myself, state),
            Effect::EndSession => end_session(state),
            Effect::ReleaseOwnedSession => {
                if state.arbiter.owns_session() {
                    end_session(state);
                }
            }
            Effect::Log(line) => state.log.add(line),
            Effect::ClearLog => state.log.clear(),
            Effect::Notify(tone, message) => state.notifier.notify(tone, message),
        }
        None
    }

    fn dispatch(
        &self,
        myself: &ActorRef<PipelineMsg>,
        state: &mut PipelineState,
        step: Step,
    ) -> Option<PipelineEvent> {
        let Some(run) = state.workflow.run.as_ref() else {
            return None;
        };
        let run_id = run.run_id;
        let command = step_command(&state.plan, step, &run.customer_numbers);

        match &command {
            ClientCommand::SshCommand { server, command, .. } => {
                state.log.add(format!("[STEP {}] {server} - {}", step.number(), step_label(step)));
                state.log.add(format!("[CMD] {command}"));
            }
            ClientCommand::ScpTransfer { transfer_name } => {
                state.log.add(format!(
                    "[STEP {}] SCP transfer {transfer_name} - {} -> {}",
                    step.number(),
                    state.plan.extract_server,
                    state.plan.load_server
                ));
            }
            ClientCommand::StartSession | ClientCommand::EndSession => {}
        }

        if let Err(e) = state.connection.send(&command) {
            return Some(PipelineEvent::DispatchFailed {
                step,
                reason: e.to_string(),
            });
        }
        tracing::info!(step = step.number(), run_id, "step dispatched");

        if let Some(timeout) = state.step_timeout {
            let _ = myself.send_after(timeout, move || PipelineMsg::StepDeadline { run_id, step });
        }
        None
    }
}

fn step_label(step: Step) -> &'static str {
    match step {
        Step::Extract => "generating DAT file",
        Step::Transfer => "transferring DAT file",
        Step::Load => "loading DAT file",
    }
}

/// Wire command for `step` of a run over `customer_numbers`.
pub fn step_command(plan: &StepPlan, step: Step, customer_numbers: &[String]) -> ClientCommand {
    match step {
        Step::Extract => ClientCommand::SshCommand {
            server: plan.extract_server.clone(),
            command: format!("{} {}", plan.extract_script, validator::join(customer_numbers)),
            throttle_interval: plan.throttle_interval,
        },
        Step::Transfer => ClientCommand::ScpTransfer {
            transfer_name: plan.transfer_name.clone(),
        },
        Step::Load => ClientCommand::SshCommand {
            server: plan.load_server.clone(),
            command: plan.load_script.clone(),
            throttle_interval: plan.throttle_interval,
        },
    }
}

fn end_session(state: &mut PipelineState) {
    if let Err(e) = state.arbiter.request_end(&state.connection) {
        state.log.add(format!("[WARNING] Session release failed: {e}"));
    }
}

fn record_history(myself: &ActorRef<PipelineMsg>, state: &mut PipelineState) {
    let Some(run) = state.workflow.run.as_ref() else {
        return;
    };
    let Some(recorder) = state.recorder.clone() else {
        tracing::debug!(batch_id = %run.batch_id, "history recording disabled");
        return;
    };
    let completed = CompletedRun {
        batch_id: run.batch_id.clone(),
        customer_numbers: run.customer_numbers.clone(),
        connection_id: state.arbiter.identity().map(str::to_string),
        started_at: run.started_at,
        completed_at: Utc::now(),
    };
    let reply_to = myself.clone();
    tokio::spawn(async move {
        let result = recorder
            .record(&completed)
            .await
            .map(|response| response.inserted_count)
            .map_err(|e| e.to_string());
        let _ = reply_to.cast(PipelineMsg::HistoryRecorded(result));
    });
}

fn snapshot(state: &PipelineState) -> PipelineSnapshot {
    let run = state.workflow.run.as_ref();
    PipelineSnapshot {
        steps: state.workflow.steps,
        running: state.workflow.running,
        last_error: state.workflow.last_error.clone(),
        batch_id: run.map(|r| r.batch_id.clone()),
        customer_numbers: run.map(|r| r.customer_numbers.clone()).unwrap_or_default(),
        timers: state.timers.snapshot(),
        logs: state.log.lines(),
        session: state.arbiter.status().clone(),
        connection_id: state.arbiter.identity().map(str::to_string),
        can_act: state.arbiter.can_act(),
        connection: state.connection.state(),
        server_health: state.server_health.clone(),
    }
}
