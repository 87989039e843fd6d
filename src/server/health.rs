//! Health and readiness probes.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::storage::Storage;

/// The deduplicated set of storages to probe, one per distinct
/// (storage type, sentinel) pair.
#[derive(Clone)]
pub struct HealthCheckState {
    pub storages: Arc<Vec<Arc<dyn Storage>>>,
}

/// 200 iff every storage adapter reports healthy; 500 on the first failure.
pub async fn health_check_handler(State(state): State<HealthCheckState>) -> Response {
    for storage in state.storages.iter() {
        if let Err(err) = storage.health_check().await {
            error!(category = "storage", "healthcheck on storage failed: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    StatusCode::OK.into_response()
}

/// Readiness flag, flipped to 500 when shutdown begins so load balancers
/// drain this instance before in-flight requests are cut off.
#[derive(Clone, Default)]
pub struct ReadinessFlag {
    status: Arc<AtomicU16>,
}

impl ReadinessFlag {
    pub fn new() -> Self {
        Self {
            status: Arc::new(AtomicU16::new(StatusCode::OK.as_u16())),
        }
    }

    pub fn start_draining(&self) {
        self.status
            .store(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), Ordering::SeqCst);
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status.load(Ordering::SeqCst))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub async fn readiness_handler(State(flag): State<ReadinessFlag>) -> Response {
    flag.status().into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{Condition, StorageResponse, TileJsonFormat};
    use crate::tile::TileCoord;
    use async_trait::async_trait;

    struct FixedHealthStorage {
        healthy: bool,
    }

    #[async_trait]
    impl Storage for FixedHealthStorage {
        async fn fetch(
            &self,
            _coord: &TileCoord,
            _cond: &Condition,
            _prefix_override: Option<&str>,
        ) -> Result<StorageResponse, StorageError> {
            Ok(StorageResponse::NotFound)
        }

        async fn tile_json(
            &self,
            _format: TileJsonFormat,
            _cond: &Condition,
            _prefix_override: Option<&str>,
        ) -> Result<StorageResponse, StorageError> {
            Ok(StorageResponse::NotFound)
        }

        async fn health_check(&self) -> Result<(), StorageError> {
            if self.healthy {
                Ok(())
            } else {
                Err(StorageError::S3("sentinel unreachable".to_string()))
            }
        }
    }

    fn state_of(storages: Vec<Arc<dyn Storage>>) -> HealthCheckState {
        HealthCheckState {
            storages: Arc::new(storages),
        }
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let state = state_of(vec![
            Arc::new(FixedHealthStorage { healthy: true }),
            Arc::new(FixedHealthStorage { healthy: true }),
        ]);
        let response = health_check_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_one_unhealthy() {
        let state = state_of(vec![
            Arc::new(FixedHealthStorage { healthy: true }),
            Arc::new(FixedHealthStorage { healthy: false }),
        ]);
        let response = health_check_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_no_storages_is_healthy() {
        let response = health_check_handler(State(state_of(vec![]))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_flip() {
        let flag = ReadinessFlag::new();
        assert_eq!(flag.status(), StatusCode::OK);

        let response = readiness_handler(State(flag.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        flag.start_draining();
        let response = readiness_handler(State(flag)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
