//! Load-history REST collaborator
//!
//! [`HistoryApi`] is the seam between orchestrators and the history service.
//! [`HttpHistoryClient`] talks to the real server; tests substitute their own
//! implementation.

mod client;
mod recorder;

pub use client::HttpHistoryClient;
pub use recorder::{CompletedRun, HistoryRecorder};

use async_trait::async_trait;
use shared_types::{
    BatchSummaryResponse, LoadHistoryCreateRequest, LoadHistoryCreateResponse,
    LoadHistoryDeleteResponse, LoadHistoryListResponse, LoadHistoryNoteUpdateResponse,
    LoadHistoryQuery, LoadHistoryResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(String),

    #[error("history API returned status {0}")]
    Status(u16),

    #[error("failed to decode history response: {0}")]
    Decode(String),

    #[error("nothing to record: {0}")]
    Incomplete(&'static str),
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn create_load_history(
        &self,
        request: &LoadHistoryCreateRequest,
    ) -> Result<LoadHistoryCreateResponse, HistoryError>;

    async fn list_load_histories(
        &self,
        query: &LoadHistoryQuery,
    ) -> Result<LoadHistoryListResponse, HistoryError>;

    async fn get_load_history(&self, id: i64) -> Result<LoadHistoryResponse, HistoryError>;

    async fn update_note(
        &self,
        id: i64,
        note: &str,
    ) -> Result<LoadHistoryNoteUpdateResponse, HistoryError>;

    async fn batch_summary(&self, batch_id: &str) -> Result<BatchSummaryResponse, HistoryError>;

    async fn customer_histories(
        &self,
        customer_number: &str,
        limit: u32,
    ) -> Result<Vec<LoadHistoryResponse>, HistoryError>;

    async fn delete_older_than(&self, days: u32) -> Result<LoadHistoryDeleteResponse, HistoryError>;
}
