//! 分片上传：接收分片、写入暂存目录、在分片齐全时提交后台合并。

use axum::body::Bytes;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Multipart, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::config::{MAX_CHUNKS_CEILING, QUEUE_FULL_RETRY_AFTER_SECS};
use crate::error::ApiError;
use crate::identity::Identity;
use crate::locking::{LockManager, LockTimeout};
use crate::merge::{MergeJob, MergeQueue, SubmitError};
use crate::paths::{PathResolver, StorageError, normalize};
use crate::session::{self, SessionDescriptor, SessionState, chunk_path};
use crate::storage::Storage;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub max_chunks: u64,
    pub retention: Duration,
    pub gc_interval: Duration,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid path")]
    InvalidPath,
    #[error("upload not found")]
    NotFound,
    #[error("upload session busy")]
    Busy,
    #[error("upload is being merged")]
    AlreadyMerging,
    #[error("merge queue is full")]
    QueueFull(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidPath => UploadError::InvalidPath,
            StorageError::Io(err) => UploadError::Io(err),
        }
    }
}

impl From<LockTimeout> for UploadError {
    fn from(_: LockTimeout) -> Self {
        UploadError::Busy
    }
}

/// 单个分片的请求参数（来自 multipart 表单与路由路径）。
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub file_id: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub destination: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub complete: bool,
    pub pending_chunks: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub file_id: String,
    pub destination: String,
    pub state: SessionState,
    pub total_chunks: u64,
    pub received_chunks: u64,
    pub pending_chunks: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// 分片接收器：持有路径解析、会话锁与合并队列。
pub struct ChunkReceiver {
    resolver: Arc<PathResolver>,
    storage: Storage,
    config: Arc<UploadConfig>,
    locks: Arc<LockManager>,
    queue: MergeQueue,
}

impl ChunkReceiver {
    pub fn new(
        resolver: Arc<PathResolver>,
        config: Arc<UploadConfig>,
        locks: Arc<LockManager>,
        queue: MergeQueue,
    ) -> Self {
        Self {
            storage: Storage::new(resolver.clone()),
            resolver,
            config,
            locks,
            queue,
        }
    }

    /// 写入一个分片；当 `[0, total_chunks)` 全部落盘时提交合并并立即返回。
    pub async fn receive(
        &self,
        identity: &Identity,
        request: ChunkRequest,
        data: Bytes,
    ) -> Result<ChunkReceipt, UploadError> {
        self.validate(&request, data.len() as u64)?;
        let destination = normalize(&request.destination)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if destination.is_empty() {
            return Err(UploadError::InvalidRequest("destination path is required".into()));
        }
        let staging_dir = self.resolver.resolve_staging(&request.file_id, identity)?;
        let destination_path = self
            .storage
            .resolve_checked(identity, &destination, true)
            .await?;

        let _guard = self.locks.lock(&staging_dir).await?;
        fs::create_dir_all(&staging_dir).await?;

        let mut descriptor = match session::load(&staging_dir).await? {
            Some(existing) => {
                if existing.total_chunks != request.total_chunks {
                    return Err(UploadError::InvalidRequest(format!(
                        "total_chunks changed from {} to {}",
                        existing.total_chunks, request.total_chunks
                    )));
                }
                if existing.destination != destination {
                    return Err(UploadError::InvalidRequest(
                        "file_id is already used for another destination".into(),
                    ));
                }
                existing
            }
            None => {
                let created =
                    SessionDescriptor::new(&request.file_id, &destination, request.total_chunks);
                session::store(&staging_dir, &created).await?;
                info!(
                    user_id = identity.user_id,
                    file_id = request.file_id,
                    destination,
                    total_chunks = request.total_chunks,
                    "upload session created"
                );
                created
            }
        };
        match descriptor.state {
            SessionState::Merging if self.queue.is_in_flight(&staging_dir).await => {
                return Err(UploadError::AlreadyMerging);
            }
            SessionState::Merging => {
                // 进程重启后没有 worker 持有该会话，重新进入接收状态。
                warn!(
                    user_id = identity.user_id,
                    file_id = request.file_id,
                    "recovering interrupted merge"
                );
                descriptor.state = SessionState::Receiving;
                session::store(&staging_dir, &descriptor).await?;
            }
            SessionState::Failed => {
                info!(
                    user_id = identity.user_id,
                    file_id = request.file_id,
                    last_error = descriptor.last_error.as_deref().unwrap_or(""),
                    "resuming failed upload session"
                );
                descriptor.state = SessionState::Receiving;
                descriptor.attempts = 0;
                descriptor.last_error = None;
                session::store(&staging_dir, &descriptor).await?;
            }
            SessionState::Receiving => {}
        }

        write_atomic(&chunk_path(&staging_dir, request.chunk_index), &data).await?;
        debug!(
            user_id = identity.user_id,
            file_id = request.file_id,
            chunk_index = request.chunk_index,
            bytes = data.len(),
            "chunk saved"
        );

        let pending = session::pending_count(&staging_dir, request.total_chunks).await?;
        if pending > 0 {
            return Ok(ChunkReceipt {
                complete: false,
                pending_chunks: pending,
            });
        }

        descriptor.state = SessionState::Merging;
        session::store(&staging_dir, &descriptor).await?;
        let job = MergeJob {
            user_id: identity.user_id,
            file_id: request.file_id.clone(),
            staging_dir: staging_dir.clone(),
            destination: destination_path,
            total_chunks: request.total_chunks,
        };
        if let Err(err) = self.queue.submit(job).await {
            warn!(
                user_id = identity.user_id,
                file_id = request.file_id,
                error = %err,
                "merge submission rejected"
            );
            descriptor.state = SessionState::Receiving;
            session::store(&staging_dir, &descriptor).await?;
            return Err(match err {
                SubmitError::Full => UploadError::QueueFull(QUEUE_FULL_RETRY_AFTER_SECS),
                SubmitError::Closed => {
                    UploadError::Io(io::Error::other("merge workers are not running"))
                }
            });
        }

        info!(
            user_id = identity.user_id,
            file_id = request.file_id,
            destination,
            total_chunks = request.total_chunks,
            "upload complete, merge queued"
        );
        Ok(ChunkReceipt {
            complete: true,
            pending_chunks: 0,
        })
    }

    /// 查询会话进度。
    pub async fn status(&self, identity: &Identity, file_id: &str) -> Result<UploadStatus, UploadError> {
        let staging_dir = self.resolver.resolve_staging(file_id, identity)?;
        let descriptor = session::load(&staging_dir)
            .await?
            .ok_or(UploadError::NotFound)?;
        let received = session::received_ordinals(&staging_dir)
            .await?
            .range(..descriptor.total_chunks)
            .count() as u64;
        Ok(UploadStatus {
            file_id: descriptor.file_id,
            destination: descriptor.destination,
            state: descriptor.state,
            total_chunks: descriptor.total_chunks,
            received_chunks: received,
            pending_chunks: descriptor.total_chunks - received,
            attempts: descriptor.attempts,
            last_error: descriptor.last_error,
        })
    }

    /// 放弃上传并删除暂存目录；合并中的会话不可放弃。
    pub async fn abort(&self, identity: &Identity, file_id: &str) -> Result<(), UploadError> {
        let staging_dir = self.resolver.resolve_staging(file_id, identity)?;
        let _guard = self.locks.lock(&staging_dir).await?;
        if !fs::try_exists(&staging_dir).await? {
            return Err(UploadError::NotFound);
        }
        if self.queue.is_in_flight(&staging_dir).await {
            return Err(UploadError::AlreadyMerging);
        }
        fs::remove_dir_all(&staging_dir).await?;
        info!(user_id = identity.user_id, file_id, "upload aborted");
        Ok(())
    }

    fn validate(&self, request: &ChunkRequest, size: u64) -> Result<(), UploadError> {
        if request.total_chunks == 0 {
            return Err(UploadError::InvalidRequest("total_chunks must be positive".into()));
        }
        if request.chunk_index >= request.total_chunks {
            return Err(UploadError::InvalidRequest(
                "chunk_index must be less than total_chunks".into(),
            ));
        }
        let max_chunks = self.config.max_chunks.min(MAX_CHUNKS_CEILING);
        if request.total_chunks > max_chunks {
            return Err(UploadError::InvalidRequest("too many chunks".into()));
        }
        if size > self.config.max_chunk_size {
            return Err(UploadError::InvalidRequest("chunk too large".into()));
        }
        Ok(())
    }
}

/// 上传单个分片（multipart 表单：file_id、chunk_index、total_chunks、chunk_data）。
pub async fn upload_chunk(
    Extension(receiver): Extension<Arc<ChunkReceiver>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
    multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<ChunkReceipt>), ApiError> {
    let (request, data) = read_chunk_form(multipart, path, receiver.config.max_chunk_size).await?;
    let receipt = receiver.receive(&identity, request, data).await?;
    let status = if receipt.complete {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, JsonResponse(receipt)))
}

/// 查询上传会话状态。
pub async fn upload_status(
    Extension(receiver): Extension<Arc<ChunkReceiver>>,
    Extension(identity): Extension<Identity>,
    Path(file_id): Path<String>,
) -> Result<JsonResponse<UploadStatus>, ApiError> {
    Ok(JsonResponse(receiver.status(&identity, &file_id).await?))
}

/// 中止上传并清理暂存目录。
pub async fn abort_upload(
    Extension(receiver): Extension<Arc<ChunkReceiver>>,
    Extension(identity): Extension<Identity>,
    Path(file_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    receiver.abort(&identity, &file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_chunk_form(
    mut multipart: Multipart,
    destination: String,
    max_chunk_size: u64,
) -> Result<(ChunkRequest, Bytes), UploadError> {
    let mut file_id = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| UploadError::InvalidRequest(err.body_text()))?
    {
        match field.name().unwrap_or_default() {
            "file_id" => file_id = Some(field_text(field).await?),
            "chunk_index" => chunk_index = Some(parse_count(field, "chunk_index").await?),
            "total_chunks" => total_chunks = Some(parse_count(field, "total_chunks").await?),
            "chunk_data" => data = Some(field_bytes(field, max_chunk_size).await?),
            _ => {}
        }
    }

    let missing = |name: &str| UploadError::InvalidRequest(format!("{name} is required"));
    let request = ChunkRequest {
        file_id: file_id.ok_or_else(|| missing("file_id"))?,
        chunk_index: chunk_index.ok_or_else(|| missing("chunk_index"))?,
        total_chunks: total_chunks.ok_or_else(|| missing("total_chunks"))?,
        destination,
    };
    Ok((request, data.ok_or_else(|| missing("chunk_data"))?))
}

async fn field_text(field: Field<'_>) -> Result<String, UploadError> {
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(|err| UploadError::InvalidRequest(err.body_text()))
}

async fn parse_count(field: Field<'_>, name: &str) -> Result<u64, UploadError> {
    field_text(field)
        .await?
        .parse::<u64>()
        .map_err(|_| UploadError::InvalidRequest(format!("{name} must be a non-negative integer")))
}

async fn field_bytes(mut field: Field<'_>, limit: u64) -> Result<Bytes, UploadError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| UploadError::InvalidRequest(err.body_text()))?
    {
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(UploadError::InvalidRequest("chunk too large".into()));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}
