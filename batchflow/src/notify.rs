//! Toast notifications for the presentation layer
//!
//! Orchestrators never render anything themselves; they push [`ToastPayload`]s
//! into a channel that the UI (or the CLI) drains.

use shared_types::{ToastPayload, ToastTone};
use tokio::sync::mpsc;

/// Sending half handed to orchestrators
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<ToastPayload>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ToastPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that only logs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, tone: ToastTone, message: impl Into<String>) {
        let message = message.into();
        match tone {
            ToastTone::Error => tracing::error!(%message, "notification"),
            ToastTone::Warning => tracing::warn!(%message, "notification"),
            ToastTone::Info | ToastTone::Success => tracing::info!(%message, "notification"),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(ToastPayload { tone, message });
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(ToastTone::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.notify(ToastTone::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(ToastTone::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(ToastTone::Error, message);
    }
}
