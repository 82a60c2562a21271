//! Server-directed extract → transfer → load workflow
//!
//! - [`state`]: pure step reducer
//! - [`protocol`]: actor messages, errors and snapshot
//! - [`actor`]: the ractor actor owning the run
//!
//! Callers use [`PipelineHandle`], which wires a [`ConnectionManager`] to a
//! freshly spawned [`PipelineActor`].

pub mod actor;
pub mod protocol;
pub mod state;

pub use actor::{step_command, PipelineActor, PipelineArguments};
pub use protocol::{PipelineError, PipelineMsg, PipelineSnapshot};
pub use state::{Phase, Step};

use std::sync::Arc;
use std::time::Duration;

use ractor::{call, Actor, ActorRef};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, ReconnectPolicy, StepPlan};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::history::HistoryRecorder;
use crate::notify::Notifier;

/// Everything needed to spawn a pipeline orchestrator
#[derive(Clone)]
pub struct PipelineOptions {
    pub reconnect: ReconnectPolicy,
    pub plan: StepPlan,
    pub recorder: Option<HistoryRecorder>,
    pub notifier: Notifier,
    pub step_timeout: Option<Duration>,
    pub log_capacity: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config, recorder: Option<HistoryRecorder>, notifier: Notifier) -> Self {
        Self {
            reconnect: config.reconnect,
            plan: config.steps.clone(),
            recorder,
            notifier,
            step_timeout: config.step_timeout,
            log_capacity: config.output_log_capacity,
        }
    }
}

#[derive(Clone)]
pub struct PipelineHandle {
    actor: ActorRef<PipelineMsg>,
    connection: Arc<ConnectionManager>,
}

impl PipelineHandle {
    pub async fn spawn(options: PipelineOptions) -> Result<(Self, JoinHandle<()>), PipelineError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(options.reconnect, events_tx));

        let args = PipelineArguments {
            connection: connection.clone(),
            events: events_rx,
            plan: options.plan,
            recorder: options.recorder,
            notifier: options.notifier,
            step_timeout: options.step_timeout,
            log_capacity: options.log_capacity,
        };
        let (actor, handle) = Actor::spawn(None, PipelineActor, args)
            .await
            .map_err(|e| PipelineError::Actor(e.to_string()))?;

        Ok((Self { actor, connection }, handle))
    }

    pub async fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        self.connection.connect(url).await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn start(&self, numbers: Vec<String>) -> Result<(), PipelineError> {
        call!(self.actor, |reply| PipelineMsg::Start { numbers, reply })
            .map_err(|e| PipelineError::Actor(e.to_string()))?
    }

    pub async fn cancel(&self) -> Result<(), PipelineError> {
        call!(self.actor, |reply| PipelineMsg::Cancel { reply })
            .map_err(|e| PipelineError::Actor(e.to_string()))?
    }

    pub async fn reset(&self) -> Result<(), PipelineError> {
        call!(self.actor, |reply| PipelineMsg::Reset { reply })
            .map_err(|e| PipelineError::Actor(e.to_string()))
    }

    pub async fn snapshot(&self) -> Result<PipelineSnapshot, PipelineError> {
        call!(self.actor, |reply| PipelineMsg::GetSnapshot { reply })
            .map_err(|e| PipelineError::Actor(e.to_string()))
    }

    /// Close the socket normally and stop the actor.
    pub async fn shutdown(&self) {
        self.connection.close().await;
        self.actor.stop(None);
    }
}
