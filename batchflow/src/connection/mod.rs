//! WebSocket connection with automatic reconnection
//!
//! A [`ConnectionManager`] owns one logical connection. The socket itself
//! lives on a supervisor task (see [`link`]) which reports everything it
//! observes as [`ConnectionEvent`]s on the channel supplied at construction.
//!
//! Reconnection rules:
//! - a close with code 1000 is final, anything else (including a dropped
//!   TCP stream or a failed dial) schedules a retry after the policy delay
//! - the attempt counter resets on every successful open
//! - after `max_attempts` consecutive failures a single
//!   [`ConnectionEvent::ReconnectExhausted`] is emitted and the supervisor stops
//! - [`ConnectionManager::close`] cancels any pending retry

mod link;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// A text frame from the server, undecoded
    Message(String),
    Closed {
        code: Option<u16>,
        abnormal: bool,
    },
    Reconnecting {
        attempt: u32,
        max: u32,
    },
    ReconnectExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) struct Shared {
    pub(crate) state: ConnectionState,
    pub(crate) outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl Shared {
    pub(crate) fn set_open(&mut self, outbound: mpsc::UnboundedSender<Message>) {
        self.state = ConnectionState::Open;
        self.outbound = Some(outbound);
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if state != ConnectionState::Open {
            self.outbound = None;
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shared: Arc<Mutex<Shared>>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            policy,
            events,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                outbound: None,
            })),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().expect("connection lock poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Dial `url` and wait for the first attempt to settle.
    ///
    /// Returns immediately while a socket is already open or being dialled.
    /// A failed first attempt is reported here and retried in the background
    /// under the reconnect policy.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        let first_attempt = {
            let mut supervisor = self.supervisor.lock().expect("supervisor lock poisoned");
            {
                let mut shared = self.shared.lock().expect("connection lock poisoned");
                match shared.state {
                    ConnectionState::Open | ConnectionState::Connecting => return Ok(()),
                    ConnectionState::Disconnected | ConnectionState::Closing => {}
                }
                shared.set_state(ConnectionState::Connecting);
            }

            if let Some(previous) = supervisor.take() {
                previous.cancel.cancel();
            }

            let cancel = CancellationToken::new();
            let (first_tx, first_rx) = oneshot::channel();
            let handle = tokio::spawn(link::supervise(link::LinkParams {
                url: url.to_string(),
                policy: self.policy,
                shared: self.shared.clone(),
                events: self.events.clone(),
                cancel: cancel.clone(),
                first_attempt: first_tx,
            }));
            *supervisor = Some(Supervisor { cancel, handle });
            first_rx
        };

        match first_attempt.await {
            Ok(result) => result,
            // Supervisor cancelled before its first dial finished
            Err(_) => Err(ConnectionError::NotConnected),
        }
    }

    /// Serialize `message` as JSON and queue it on the open socket.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(message)?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        let shared = self.shared.lock().expect("connection lock poisoned");
        match (&shared.state, &shared.outbound) {
            (ConnectionState::Open, Some(outbound)) => outbound
                .send(Message::Text(text))
                .map_err(|_| ConnectionError::NotConnected),
            _ => {
                tracing::warn!(state = ?shared.state, "send attempted without an open socket");
                Err(ConnectionError::NotConnected)
            }
        }
    }

    /// Close with code 1000 and stop reconnecting.
    pub async fn close(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take();
        let Some(supervisor) = supervisor else {
            return;
        };

        self.shared
            .lock()
            .expect("connection lock poisoned")
            .set_state(ConnectionState::Closing);
        supervisor.cancel.cancel();
        if let Err(e) = supervisor.handle.await {
            tracing::warn!("connection supervisor ended abnormally: {e}");
        }
        self.shared
            .lock()
            .expect("connection lock poisoned")
            .set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(supervisor) = supervisor.take() {
                supervisor.cancel.cancel();
            }
        }
    }
}
