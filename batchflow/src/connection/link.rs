use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionError, ConnectionEvent, ConnectionState, Shared, NORMAL_CLOSE};
use crate::config::ReconnectPolicy;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub(super) struct LinkParams {
    pub url: String,
    pub policy: ReconnectPolicy,
    pub shared: Arc<Mutex<Shared>>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub cancel: CancellationToken,
    pub first_attempt: oneshot::Sender<Result<(), ConnectionError>>,
}

/// How a socket session ended
struct Ended {
    code: Option<u16>,
}

impl Ended {
    fn is_abnormal(&self) -> bool {
        self.code != Some(NORMAL_CLOSE)
    }
}

pub(super) async fn supervise(params: LinkParams) {
    let LinkParams {
        url,
        policy,
        shared,
        events,
        cancel,
        first_attempt,
    } = params;
    let mut first_attempt = Some(first_attempt);
    let mut attempts: u32 = 0;

    loop {
        shared
            .lock()
            .expect("connection lock poisoned")
            .set_state(ConnectionState::Connecting);

        let dialled = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match dialled {
            Ok((ws, _)) => {
                attempts = 0;
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                shared
                    .lock()
                    .expect("connection lock poisoned")
                    .set_open(out_tx);
                info!(%url, "WebSocket connected");
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(Ok(()));
                }
                let _ = events.send(ConnectionEvent::Opened);

                let ended = pump(ws, out_rx, &events, &cancel).await;
                shared
                    .lock()
                    .expect("connection lock poisoned")
                    .set_state(ConnectionState::Disconnected);

                let abnormal = ended.is_abnormal() && !cancel.is_cancelled();
                info!(code = ?ended.code, abnormal, "WebSocket closed");
                let _ = events.send(ConnectionEvent::Closed {
                    code: ended.code,
                    abnormal,
                });
                if !abnormal {
                    break;
                }
            }
            Err(e) => {
                warn!(%url, "WebSocket connect failed: {e}");
                shared
                    .lock()
                    .expect("connection lock poisoned")
                    .set_state(ConnectionState::Disconnected);
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(Err(ConnectionError::Connect(e.to_string())));
                }
            }
        }

        if attempts >= policy.max_attempts {
            warn!(max = policy.max_attempts, "reconnect attempts exhausted");
            let _ = events.send(ConnectionEvent::ReconnectExhausted);
            break;
        }
        attempts += 1;
        debug!(attempt = attempts, max = policy.max_attempts, delay = ?policy.delay, "scheduling reconnect");
        let _ = events.send(ConnectionEvent::Reconnecting {
            attempt: attempts,
            max: policy.max_attempts,
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }

    shared
        .lock()
        .expect("connection lock poisoned")
        .set_state(ConnectionState::Disconnected);
}

/// Shuttle frames until the socket ends or `cancel` fires.
async fn pump(
    ws: Socket,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    cancel: &CancellationToken,
) -> Ended {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("close frame not delivered: {e}");
                }
                return Ended { code: Some(NORMAL_CLOSE) };
            }
            queued = outbound.recv() => {
                let Some(msg) = queued else {
                    return Ended { code: None };
                };
                if let Err(e) = sink.send(msg).await {
                    warn!("WebSocket write failed: {e}");
                    return Ended { code: None };
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnectionEvent::Message(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ended {
                        code: frame.map(|f| u16::from(f.code)),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket read failed: {e}");
                    return Ended { code: None };
                }
                None => return Ended { code: None },
            },
        }
    }
}
