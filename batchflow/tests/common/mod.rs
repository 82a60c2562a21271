//! Shared harness for the integration tests
//!
//! `FakeServer` is an in-process axum WebSocket endpoint. Every accepted
//! socket is handed to the test as a `FakeConn`, which reads what the client
//! sent and scripts what the server pushes back.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use batchflow::history::{HistoryApi, HistoryError};
use batchflow::pipeline::{PipelineHandle, PipelineSnapshot};
use shared_types::{
    BatchSummaryResponse, LoadHistoryCreateRequest, LoadHistoryCreateResponse,
    LoadHistoryDeleteResponse, LoadHistoryListResponse, LoadHistoryNoteUpdateResponse,
    LoadHistoryQuery, LoadHistoryResponse, ToastPayload,
};

pub const STEP: Duration = Duration::from_secs(5);

enum Outgoing {
    Json(Value),
    Close(u16),
    Drop,
}

pub struct FakeConn {
    from_client: mpsc::UnboundedReceiver<Value>,
    to_client: mpsc::UnboundedSender<Outgoing>,
}

impl FakeConn {
    /// Next JSON frame the client sent.
    pub async fn recv(&mut self) -> Value {
        timeout(STEP, self.from_client.recv())
            .await
            .expect("Timeout waiting for client frame")
            .expect("Client connection ended")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.from_client.recv()).await.ok().flatten()
    }

    pub fn send(&self, value: Value) {
        self.to_client
            .send(Outgoing::Json(value))
            .expect("Server connection task ended");
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Outgoing::Close(code));
    }

    /// Tear the TCP stream down without a close handshake.
    pub fn drop_abruptly(&self) {
        let _ = self.to_client.send(Outgoing::Drop);
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<FakeConn>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl FakeServer {
    pub async fn start() -> Self {
        let (conn_tx, connections) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(conn_tx);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("Server failed");
        });

        Self {
            addr,
            connections,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn accept(&mut self) -> FakeConn {
        timeout(STEP, self.connections.recv())
            .await
            .expect("Timeout waiting for client connection")
            .expect("Server stopped")
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(conn_tx): State<mpsc::UnboundedSender<FakeConn>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_conn(socket, conn_tx))
}

async fn serve_conn(socket: WebSocket, conn_tx: mpsc::UnboundedSender<FakeConn>) {
    let (from_client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, mut outgoing) = mpsc::unbounded_channel();
    if conn_tx
        .send(FakeConn {
            from_client,
            to_client,
        })
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        let _ = from_client_tx.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = outgoing.recv() => match out {
                Some(Outgoing::Json(value)) => {
                    if sink.send(Message::Text(value.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close(code)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                Some(Outgoing::Drop) | None => break,
            },
        }
    }
}

/// Poll the pipeline until `pred` holds.
pub async fn wait_for_snapshot(
    pipeline: &PipelineHandle,
    pred: impl Fn(&PipelineSnapshot) -> bool,
) -> PipelineSnapshot {
    timeout(STEP, async {
        loop {
            let snapshot = pipeline.snapshot().await.expect("snapshot");
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for pipeline state")
}

pub async fn wait_for_toast(
    toasts: &mut mpsc::UnboundedReceiver<ToastPayload>,
    pred: impl Fn(&ToastPayload) -> bool,
) -> ToastPayload {
    timeout(STEP, async {
        loop {
            let toast = toasts.recv().await.expect("notifier dropped");
            if pred(&toast) {
                return toast;
            }
        }
    })
    .await
    .expect("Timeout waiting for notification")
}

/// History API double that records create calls
#[derive(Default)]
pub struct RecordingHistory {
    pub fail: bool,
    calls: Mutex<Vec<LoadHistoryCreateRequest>>,
}

impl RecordingHistory {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<LoadHistoryCreateRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryApi for RecordingHistory {
    async fn create_load_history(
        &self,
        request: &LoadHistoryCreateRequest,
    ) -> Result<LoadHistoryCreateResponse, HistoryError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(HistoryError::Status(500));
        }
        Ok(LoadHistoryCreateResponse {
            success: true,
            message: "ok".to_string(),
            batch_id: request.batch_id.clone(),
            inserted_count: request.customer_numbers.len() as u64,
        })
    }

    async fn list_load_histories(
        &self,
        _query: &LoadHistoryQuery,
    ) -> Result<LoadHistoryListResponse, HistoryError> {
        Err(HistoryError::Status(501))
    }

    async fn get_load_history(&self, _id: i64) -> Result<LoadHistoryResponse, HistoryError> {
        Err(HistoryError::Status(501))
    }

    async fn update_note(
        &self,
        _id: i64,
        _note: &str,
    ) -> Result<LoadHistoryNoteUpdateResponse, HistoryError> {
        Err(HistoryError::Status(501))
    }

    async fn batch_summary(&self, _batch_id: &str) -> Result<BatchSummaryResponse, HistoryError> {
        Err(HistoryError::Status(501))
    }

    async fn customer_histories(
        &self,
        _customer_number: &str,
        _limit: u32,
    ) -> Result<Vec<LoadHistoryResponse>, HistoryError> {
        Err(HistoryError::Status(501))
    }

    async fn delete_older_than(&self, _days: u32) -> Result<LoadHistoryDeleteResponse, HistoryError> {
        Err(HistoryError::Status(501))
    }
}
