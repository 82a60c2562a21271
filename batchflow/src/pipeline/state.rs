//! Pipeline step transitions
//!
//! [`reduce`] is a pure function: given the current [`WorkflowState`] and one
//! [`PipelineEvent`] it returns the next state plus the [`Effect`]s the actor
//! must carry out (sending commands, driving timers, writing log lines).
//! Nothing in here touches the network or the clock.

use chrono::{DateTime, Utc};
use shared_types::{StepStatus, ToastTone};

/// The three ordered stages of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// DAT file generation on the extraction server
    Extract,
    /// SCP transfer between servers
    Transfer,
    /// DAT file load on the target server
    Load,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Extract, Step::Transfer, Step::Load];

    pub fn index(self) -> usize {
        match self {
            Step::Extract => 0,
            Step::Transfer => 1,
            Step::Load => 2,
        }
    }

    /// 1-based number used in operator-facing text
    pub fn number(self) -> usize {
        self.index() + 1
    }

    pub fn next(self) -> Option<Step> {
        match self {
            Step::Extract => Some(Step::Transfer),
            Step::Transfer => Some(Step::Load),
            Step::Load => None,
        }
    }
}

/// Timed phases: the whole run plus one per step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Total,
    Step(Step),
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Total,
        Phase::Step(Step::Extract),
        Phase::Step(Step::Transfer),
        Phase::Step(Step::Load),
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    /// Monotonic per actor; distinguishes stale watchdog deadlines
    pub run_id: u64,
    pub batch_id: String,
    pub customer_numbers: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowState {
    pub steps: [StepStatus; 3],
    pub run: Option<RunInfo>,
    pub running: bool,
    pub last_error: Option<String>,
}

impl WorkflowState {
    pub fn status(&self, step: Step) -> StepStatus {
        self.steps[step.index()]
    }

    pub fn running_step(&self) -> Option<Step> {
        Step::ALL
            .into_iter()
            .find(|s| self.status(*s) == StepStatus::Running)
    }

    /// A failed run blocks new starts until reset.
    pub fn needs_reset(&self) -> bool {
        self.steps.iter().any(|s| *s == StepStatus::Error)
    }

    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| *s == StepStatus::Success)
    }

    fn set(&mut self, step: Step, next: StepStatus) {
        let current = self.steps[step.index()];
        debug_assert!(
            current == next || current.can_transition_to(next) || next == StepStatus::Idle,
            "illegal step transition {current:?} -> {next:?}"
        );
        self.steps[step.index()] = next;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Start(RunInfo),
    /// Server reported `complete` for the running step
    Complete { message: Option<String> },
    /// Server reported `error` for the running step
    Failed { text: String },
    /// The command for `step` could not be written to the socket
    DispatchFailed { step: Step, reason: String },
    StepTimedOut { run_id: u64, step: Step },
    Cancelled,
    ConnectionLost,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RequestSession,
    /// Send the command of `step`
    Dispatch(Step),
    StartTimer(Phase),
    StopTimer(Phase),
    TerminateTimers,
    RecordHistory,
    EndSession,
    /// End the session only when this client currently owns it
    ReleaseOwnedSession,
    Log(String),
    ClearLog,
    Notify(ToastTone, String),
}

pub fn reduce(state: &WorkflowState, event: PipelineEvent) -> (WorkflowState, Vec<Effect>) {
    let mut next = state.clone();
    let mut effects = Vec::new();

    match event {
        PipelineEvent::Start(run) => {
            if state.running || state.needs_reset() {
                return (next, effects);
            }
            next.steps = [StepStatus::Idle; 3];
            next.last_error = None;
            next.running = true;
            next.run = Some(run);
            next.set(Step::Extract, StepStatus::Running);
            effects.extend([
                Effect::RequestSession,
                Effect::Log("[INFO] Workflow started - acquiring session...".to_string()),
                Effect::StartTimer(Phase::Total),
                Effect::StartTimer(Phase::Step(Step::Extract)),
                Effect::Dispatch(Step::Extract),
            ]);
        }

        PipelineEvent::Complete { message } => {
            if let Some(message) = message.filter(|m| !m.is_empty()) {
                effects.push(Effect::Log(format!("[COMPLETE] {message}")));
            }
            let Some(step) = state.running_step() else {
                return (next, effects);
            };
            next.set(step, StepStatus::Success);
            effects.push(Effect::StopTimer(Phase::Step(step)));

            match step.next() {
                Some(following) => {
                    next.set(following, StepStatus::Running);
                    effects.extend([
                        Effect::Log(format!(
                            "[INFO] Step {} complete - starting step {}...",
                            step.number(),
                            following.number()
                        )),
                        Effect::StartTimer(Phase::Step(following)),
                        Effect::Dispatch(following),
                    ]);
                }
                None => {
                    next.running = false;
                    effects.push(Effect::StopTimer(Phase::Total));
                    if next.all_succeeded() {
                        effects.push(Effect::RecordHistory);
                    }
                    effects.extend([
                        Effect::EndSession,
                        Effect::Log("[INFO] Session released".to_string()),
                        Effect::Notify(ToastTone::Success, "All steps completed".to_string()),
                    ]);
                }
            }
        }

        PipelineEvent::Failed { text } => {
            effects.push(Effect::Log(format!("[ERROR] {text}")));
            if let Some(step) = state.running_step() {
                fail_step(&mut next, &mut effects, step);
            }
            next.last_error = Some(text.clone());
            effects.push(Effect::Notify(ToastTone::Error, text));
        }

        PipelineEvent::DispatchFailed { step, reason } => {
            if state.status(step) != StepStatus::Running {
                return (next, effects);
            }
            let text = format!("Step {} could not be dispatched: {reason}", step.number());
            effects.push(Effect::Log(format!("[ERROR] {text}")));
            fail_step(&mut next, &mut effects, step);
            next.last_error = Some(text.clone());
            effects.push(Effect::Notify(ToastTone::Error, text));
        }

        PipelineEvent::StepTimedOut { run_id, step } => {
            let current_run = state.run.as_ref().map(|r| r.run_id);
            if current_run != Some(run_id) || state.status(step) != StepStatus::Running {
                return (next, effects);
            }
            let text = format!("Step {} timed out", step.number());
            effects.push(Effect::Log(format!("[ERROR] {text}")));
            fail_step(&mut next, &mut effects, step);
            next.last_error = Some(text.clone());
            effects.push(Effect::Notify(ToastTone::Error, text));
        }

        PipelineEvent::Cancelled => {
            if !state.running {
                return (next, effects);
            }
            abandon(&mut next, &mut effects);
            effects.extend([
                Effect::EndSession,
                Effect::Log("[INFO] Workflow cancelled - session released".to_string()),
                Effect::Notify(ToastTone::Warning, "Workflow cancelled".to_string()),
            ]);
        }

        PipelineEvent::ConnectionLost => {
            if !state.running {
                return (next, effects);
            }
            abandon(&mut next, &mut effects);
            effects.extend([
                Effect::Log("[INFO] Connection lost - workflow aborted".to_string()),
                Effect::Notify(
                    ToastTone::Warning,
                    "Connection lost, workflow aborted".to_string(),
                ),
            ]);
        }

        PipelineEvent::Reset => {
            next = WorkflowState::default();
            effects.extend([
                Effect::TerminateTimers,
                Effect::ClearLog,
                Effect::ReleaseOwnedSession,
            ]);
        }
    }

    (next, effects)
}

fn fail_step(next: &mut WorkflowState, effects: &mut Vec<Effect>, step: Step) {
    next.set(step, StepStatus::Error);
    next.running = false;
    effects.extend([
        Effect::StopTimer(Phase::Step(step)),
        Effect::StopTimer(Phase::Total),
    ]);
}

/// Shared terminal reset for operator cancel and connection loss.
fn abandon(next: &mut WorkflowState, effects: &mut Vec<Effect>) {
    next.steps = [StepStatus::Idle; 3];
    next.running = false;
    next.run = None;
    effects.push(Effect::TerminateTimers);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_info(run_id: u64) -> RunInfo {
        RunInfo {
            run_id,
            batch_id: format!("batch-{run_id}"),
            customer_numbers: vec!["123456789".to_string()],
            started_at: Utc::now(),
        }
    }

    fn started() -> WorkflowState {
        reduce(&WorkflowState::default(), PipelineEvent::Start(run_info(1))).0
    }

    fn complete() -> PipelineEvent {
        PipelineEvent::Complete { message: None }
    }

    #[test]
    fn test_start_dispatches_first_step() {
        let (state, effects) = reduce(&WorkflowState::default(), PipelineEvent::Start(run_info(1)));
        assert!(state.running);
        assert_eq!(state.status(Step::Extract), StepStatus::Running);
        assert_eq!(state.status(Step::Transfer), StepStatus::Idle);
        assert_eq!(effects[0], Effect::RequestSession);
        assert!(effects.contains(&Effect::StartTimer(Phase::Total)));
        assert!(effects.contains(&Effect::Dispatch(Step::Extract)));
    }

    #[test]
    fn test_complete_chains_steps_in_order() {
        let (state, effects) = reduce(&started(), complete());
        assert_eq!(state.status(Step::Extract), StepStatus::Success);
        assert_eq!(state.status(Step::Transfer), StepStatus::Running);
        assert!(effects.contains(&Effect::StopTimer(Phase::Step(Step::Extract))));
        assert!(effects.contains(&Effect::Dispatch(Step::Transfer)));
        assert!(!effects.contains(&Effect::RecordHistory));

        let (state, effects) = reduce(&state, complete());
        assert_eq!(state.status(Step::Load), StepStatus::Running);
        assert!(effects.contains(&Effect::Dispatch(Step::Load)));

        let (state, effects) = reduce(&state, complete());
        assert!(state.all_succeeded());
        assert!(!state.running);
        assert!(effects.contains(&Effect::StopTimer(Phase::Total)));
        assert!(effects.contains(&Effect::RecordHistory));
        assert!(effects.contains(&Effect::EndSession));
    }

    #[test]
    fn test_error_is_terminal_until_reset() {
        let (state, _) = reduce(&started(), complete());
        let (state, effects) = reduce(
            &state,
            PipelineEvent::Failed {
                text: "scp failed".to_string(),
            },
        );
        assert_eq!(state.status(Step::Transfer), StepStatus::Error);
        assert_eq!(state.status(Step::Load), StepStatus::Idle);
        assert!(!state.running);
        assert!(state.needs_reset());
        assert!(effects.contains(&Effect::Log("[ERROR] scp failed".to_string())));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));
        assert!(!effects.contains(&Effect::RecordHistory));

        // Further completes and starts are ignored
        let (after, effects) = reduce(&state, complete());
        assert_eq!(after.steps, state.steps);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));
        let (after, effects) = reduce(&state, PipelineEvent::Start(run_info(2)));
        assert_eq!(after, state);
        assert!(effects.is_empty());

        let (after, effects) = reduce(&state, PipelineEvent::Reset);
        assert_eq!(after, WorkflowState::default());
        assert!(effects.contains(&Effect::TerminateTimers));
        assert!(effects.contains(&Effect::ClearLog));
    }

    #[test]
    fn test_cancel_and_connection_loss_reset_to_idle() {
        for event in [PipelineEvent::Cancelled, PipelineEvent::ConnectionLost] {
            let cancel = event == PipelineEvent::Cancelled;
            let (state, effects) = reduce(&started(), event);
            assert_eq!(state.steps, [StepStatus::Idle; 3]);
            assert!(!state.running);
            assert!(effects.contains(&Effect::TerminateTimers));
            assert!(!effects.contains(&Effect::RecordHistory));
            assert_eq!(effects.contains(&Effect::EndSession), cancel);
        }
    }

    #[test]
    fn test_idle_connection_loss_is_noop() {
        let (state, effects) = reduce(&WorkflowState::default(), PipelineEvent::ConnectionLost);
        assert_eq!(state, WorkflowState::default());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_stale_timeout_ignored() {
        let state = started();
        let (after, effects) = reduce(
            &state,
            PipelineEvent::StepTimedOut {
                run_id: 99,
                step: Step::Extract,
            },
        );
        assert_eq!(after, state);
        assert!(effects.is_empty());

        let (after, _) = reduce(
            &state,
            PipelineEvent::StepTimedOut {
                run_id: 1,
                step: Step::Extract,
            },
        );
        assert_eq!(after.status(Step::Extract), StepStatus::Error);
    }

    #[test]
    fn test_status_sequences_never_repeat_running() {
        // Random-ish message storm; every step must only move forward
        let events = [
            complete(),
            PipelineEvent::Failed {
                text: "x".to_string(),
            },
            complete(),
            complete(),
        ];
        let mut state = started();
        let mut history: Vec<[StepStatus; 3]> = vec![state.steps];
        for event in events {
            state = reduce(&state, event).0;
            history.push(state.steps);
        }
        for step in Step::ALL {
            let seq: Vec<StepStatus> = history.iter().map(|s| s[step.index()]).collect();
            let mut seen_running = false;
            for pair in seq.windows(2) {
                if pair[0] != pair[1] {
                    assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
                }
                if pair[1] == StepStatus::Running && pair[0] != StepStatus::Running {
                    assert!(!seen_running);
                    seen_running = true;
                }
            }
        }
    }
}
