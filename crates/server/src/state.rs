use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use notify::RecommendedWatcher;
use parking_lot::RwLock;
use scanner::{EventBroker, Scanner};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<ServerConfig>>,
    pub scanner: Arc<Scanner>,
    pub events: EventBroker,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ScanStartedResponse {
    pub started: bool,
    pub full_rescan: bool,
}

#[derive(Deserialize)]
pub struct ScanQuery {
    #[serde(default)]
    pub full: bool,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[cfg(test)]
mod tests {
    use super::{ScanQuery, ScanStartedResponse};

    #[test]
    fn scan_query_defaults_to_incremental() {
        let query: ScanQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.full);
        let query: ScanQuery = serde_json::from_str(r#"{"full":true}"#).unwrap();
        assert!(query.full);
    }

    #[test]
    fn scan_started_response_shape() {
        let value = serde_json::to_value(ScanStartedResponse {
            started: true,
            full_rescan: false,
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"started": true, "full_rescan": false}));
    }
}
