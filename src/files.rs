//! 文件与目录的 HTTP 处理器：下载、直接写入、移动、删除、列表、创建与改名。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::identity::Identity;
use crate::locking::LockManager;
use crate::storage::{FileEntry, Storage};

#[derive(Deserialize)]
pub(crate) struct MoveBody {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    name: String,
}

/// 列出用户根目录。
pub async fn list_root(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(identity): Extension<Identity>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    list(&storage, &identity, "").await
}

/// 列出指定目录。
pub async fn list_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    list(&storage, &identity, &path).await
}

async fn list(
    storage: &Storage,
    identity: &Identity,
    path: &str,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let entries = storage.list_dir(identity, path).await?;
    debug!(user_id = identity.user_id, path, count = entries.len(), "list folder");
    Ok(JsonResponse(entries))
}

pub async fn create_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = storage.resolver().resolve(&path, &identity)?;
    let _guard = locks.lock(&key).await?;
    storage.create_dir(&identity, &path).await?;
    info!(user_id = identity.user_id, path, "create folder");
    Ok(StatusCode::CREATED)
}

/// 同级改名，请求体 `{"name": "..."}`。
pub async fn rename_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
    Json(RenameBody { name }): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    let key = storage.resolver().resolve(&path, &identity)?;
    let _guard = locks.lock(&key).await?;
    storage.rename(&identity, &path, &name).await?;
    info!(user_id = identity.user_id, path, name, "rename folder");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = storage.resolver().resolve(&path, &identity)?;
    let _guard = locks.lock(&key).await?;
    storage.delete_dir(&identity, &path).await?;
    info!(user_id = identity.user_id, path, "delete folder");
    Ok(StatusCode::NO_CONTENT)
}

/// 下载完整文件，附带 Content-Type、Content-Length 与 Last-Modified。
pub async fn download_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let (file, metadata) = storage.open_file(&identity, &path).await?;
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("invalid header value".into()))?,
        );
    }

    info!(user_id = identity.user_id, path, size = file_size, "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 直接写入原始请求体，目标被原子替换。
pub async fn write_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
    body: AxumBody,
) -> Result<StatusCode, ApiError> {
    let key = storage.resolver().resolve(&path, &identity)?;
    let _guard = locks.lock(&key).await?;
    let data_stream = BodyExt::into_data_stream(body);
    storage.write_file(&identity, &path, data_stream).await?;
    info!(user_id = identity.user_id, path, "write file");
    Ok(StatusCode::CREATED)
}

/// 移动到 `{"path": "..."}` 指定的位置，不覆盖已有目标。
pub async fn move_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
    Json(MoveBody { path: to }): Json<MoveBody>,
) -> Result<StatusCode, ApiError> {
    let from_key = storage.resolver().resolve(&path, &identity)?;
    let to_key = storage.resolver().resolve(&to, &identity)?;
    // 固定加锁顺序，避免相向移动互相等待。
    let (first, second) = if from_key <= to_key {
        (from_key, to_key)
    } else {
        (to_key, from_key)
    };
    let _first = locks.lock(&first).await?;
    let _second = if first != second {
        Some(locks.lock(&second).await?)
    } else {
        None
    };
    storage.move_entry(&identity, &path, &to).await?;
    info!(user_id = identity.user_id, from = path, to, "move file");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(identity): Extension<Identity>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = storage.resolver().resolve(&path, &identity)?;
    let _guard = locks.lock(&key).await?;
    storage.delete_file(&identity, &path).await?;
    info!(user_id = identity.user_id, path, "delete file");
    Ok(StatusCode::NO_CONTENT)
}
