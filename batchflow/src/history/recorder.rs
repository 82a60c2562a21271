use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared_types::{LoadHistoryCreateRequest, LoadHistoryCreateResponse};

use super::{HistoryApi, HistoryError};

/// The server derives the real address from the request itself.
const CLIENT_IP_PLACEHOLDER: &str = "unknown";

/// Everything needed to describe a run that finished with every step successful
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub batch_id: String,
    pub customer_numbers: Vec<String>,
    pub connection_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedRun {
    pub fn execution_time_seconds(&self) -> f64 {
        let elapsed = self.completed_at - self.started_at;
        elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or_else(|| elapsed.num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Clone)]
pub struct HistoryRecorder {
    api: Arc<dyn HistoryApi>,
}

impl HistoryRecorder {
    pub fn new(api: Arc<dyn HistoryApi>) -> Self {
        Self { api }
    }

    pub fn build_request(run: &CompletedRun) -> LoadHistoryCreateRequest {
        LoadHistoryCreateRequest {
            batch_id: run.batch_id.clone(),
            customer_numbers: run.customer_numbers.clone(),
            client_ip: CLIENT_IP_PLACEHOLDER.to_string(),
            connection_id: run.connection_id.clone(),
            execution_time_seconds: run.execution_time_seconds(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }

    pub async fn record(&self, run: &CompletedRun) -> Result<LoadHistoryCreateResponse, HistoryError> {
        if run.customer_numbers.is_empty() {
            return Err(HistoryError::Incomplete("no customer numbers"));
        }
        let request = Self::build_request(run);
        let response = self.api.create_load_history(&request).await?;
        tracing::info!(
            batch_id = %response.batch_id,
            inserted = response.inserted_count,
            "load history recorded"
        );
        Ok(response)
    }

    /// Output log line describing a recording attempt.
    pub fn outcome_line(result: &Result<u64, String>) -> String {
        match result {
            Ok(count) => format!("[INFO] Load history saved ({count} records)"),
            Err(e) => format!("[WARNING] Failed to save load history: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn run(numbers: &[&str]) -> CompletedRun {
        let started_at = Utc::now();
        CompletedRun {
            batch_id: "batch-1".to_string(),
            customer_numbers: numbers.iter().map(|s| s.to_string()).collect(),
            connection_id: Some("conn-1".to_string()),
            started_at,
            completed_at: started_at + Duration::milliseconds(2500),
        }
    }

    #[test]
    fn test_request_carries_duration_and_identity() {
        let request = HistoryRecorder::build_request(&run(&["123456789"]));
        assert_eq!(request.client_ip, "unknown");
        assert_eq!(request.connection_id.as_deref(), Some("conn-1"));
        assert!((request.execution_time_seconds - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_lines() {
        assert_eq!(
            HistoryRecorder::outcome_line(&Ok(3)),
            "[INFO] Load history saved (3 records)"
        );
        assert!(HistoryRecorder::outcome_line(&Err("boom".to_string())).starts_with("[WARNING]"));
    }
}
