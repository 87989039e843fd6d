//! Filesystem-backed storage implementation.
//!
//! Tiles live under `{base_dir}/{layer}/{z}/{x}/{y}.{fmt}` and tilejson
//! documents under `{base_dir}/tilejson/{name}.json`. Conditional headers
//! are not evaluated; the filesystem store never answers 304.

use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::storage::{
    Condition, StorageBody, StorageResponse, SuccessfulResponse, TileJsonFormat,
};
use crate::tile::TileCoord;

/// Filesystem implementation of the storage contract.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
    layer: String,
    healthcheck: String,
}

impl FileStorage {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        layer: impl Into<String>,
        healthcheck: impl Into<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            layer: layer.into(),
            healthcheck: healthcheck.into(),
        }
    }

    async fn respond_with_path(&self, path: &Path) -> Result<StorageResponse, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                Ok(StorageResponse::Success(SuccessfulResponse {
                    body: StorageBody::Bytes(bytes.into()),
                    last_modified: None,
                    etag: None,
                    size,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(StorageResponse::NotFound)
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn tile_path(&self, coord: &TileCoord) -> PathBuf {
        let mut path = self.base_dir.clone();
        if !self.layer.is_empty() {
            path.push(&self.layer);
        }
        path.push(coord.z.to_string());
        path.push(coord.x.to_string());
        path.push(format!("{}.{}", coord.y, coord.format));
        path
    }
}

#[async_trait::async_trait]
impl super::Storage for FileStorage {
    async fn fetch(
        &self,
        coord: &TileCoord,
        _cond: &Condition,
        _prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError> {
        self.respond_with_path(&self.tile_path(coord)).await
    }

    async fn tile_json(
        &self,
        format: TileJsonFormat,
        _cond: &Condition,
        _prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError> {
        let path = self
            .base_dir
            .join("tilejson")
            .join(format!("{}.json", format.name()));
        self.respond_with_path(&path).await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        tokio::fs::File::open(self.base_dir.join(&self.healthcheck)).await?;
        Ok(())
    }
}
