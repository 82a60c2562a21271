use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared_types::{
    BatchSummaryResponse, LoadHistoryCreateRequest, LoadHistoryCreateResponse,
    LoadHistoryDeleteResponse, LoadHistoryListResponse, LoadHistoryNoteUpdateRequest,
    LoadHistoryNoteUpdateResponse, LoadHistoryQuery, LoadHistoryResponse,
};

use super::{HistoryApi, HistoryError};

const HISTORIES_PATH: &str = "/api/v1/stub/histories";

#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpHistoryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HistoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HistoryError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, HistoryError> {
        let response = request
            .send()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, %body, "history API error");
            return Err(HistoryError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| HistoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryClient {
    async fn create_load_history(
        &self,
        request: &LoadHistoryCreateRequest,
    ) -> Result<LoadHistoryCreateResponse, HistoryError> {
        tracing::debug!(
            batch_id = %request.batch_id,
            customers = request.customer_numbers.len(),
            "recording load history"
        );
        self.execute(self.http.post(self.url(HISTORIES_PATH)).json(request))
            .await
    }

    async fn list_load_histories(
        &self,
        query: &LoadHistoryQuery,
    ) -> Result<LoadHistoryListResponse, HistoryError> {
        self.execute(self.http.get(self.url(HISTORIES_PATH)).query(query))
            .await
    }

    async fn get_load_history(&self, id: i64) -> Result<LoadHistoryResponse, HistoryError> {
        self.execute(self.http.get(self.url(&format!("{HISTORIES_PATH}/{id}"))))
            .await
    }

    async fn update_note(
        &self,
        id: i64,
        note: &str,
    ) -> Result<LoadHistoryNoteUpdateResponse, HistoryError> {
        let body = LoadHistoryNoteUpdateRequest {
            note: note.to_string(),
        };
        self.execute(
            self.http
                .patch(self.url(&format!("{HISTORIES_PATH}/{id}/note")))
                .json(&body),
        )
        .await
    }

    async fn batch_summary(&self, batch_id: &str) -> Result<BatchSummaryResponse, HistoryError> {
        self.execute(
            self.http
                .get(self.url(&format!("/api/v1/stub/batches/{batch_id}"))),
        )
        .await
    }

    async fn customer_histories(
        &self,
        customer_number: &str,
        limit: u32,
    ) -> Result<Vec<LoadHistoryResponse>, HistoryError> {
        self.execute(
            self.http
                .get(self.url(&format!(
                    "/api/v1/stub/customers/{customer_number}/histories"
                )))
                .query(&[("limit", limit)]),
        )
        .await
    }

    async fn delete_older_than(&self, days: u32) -> Result<LoadHistoryDeleteResponse, HistoryError> {
        self.execute(
            self.http
                .delete(self.url(HISTORIES_PATH))
                .query(&[("days", days)]),
        )
        .await
    }
}
