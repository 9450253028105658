//! 上传会话描述文件（`session.json`）与暂存分片扫描。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

use crate::atomic::{is_temp_name, write_atomic};
use crate::config::SESSION_FILE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Receiving,
    Merging,
    Failed,
}

/// Persisted next to the chunks so completeness can be checked before a merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub file_id: String,
    pub destination: String,
    pub total_chunks: u64,
    pub state: SessionState,
    pub created_at: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionDescriptor {
    pub fn new(file_id: &str, destination: &str, total_chunks: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            file_id: file_id.to_string(),
            destination: destination.to_string(),
            total_chunks,
            state: SessionState::Receiving,
            created_at,
            attempts: 0,
            last_error: None,
        }
    }
}

pub fn descriptor_path(staging_dir: &Path) -> PathBuf {
    staging_dir.join(SESSION_FILE)
}

pub fn chunk_path(staging_dir: &Path, ordinal: u64) -> PathBuf {
    staging_dir.join(ordinal.to_string())
}

/// 读取会话描述；目录或文件不存在时返回 `None`。
pub async fn load(staging_dir: &Path) -> io::Result<Option<SessionDescriptor>> {
    let bytes = match fs::read(descriptor_path(staging_dir)).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub async fn store(staging_dir: &Path, descriptor: &SessionDescriptor) -> io::Result<()> {
    let contents = serde_json::to_vec_pretty(descriptor)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_atomic(&descriptor_path(staging_dir), &contents).await
}

/// 扫描暂存目录中已落盘的分片序号（忽略描述文件与临时文件）。
pub async fn received_ordinals(staging_dir: &Path) -> io::Result<BTreeSet<u64>> {
    let mut ordinals = BTreeSet::new();
    let mut dir = match fs::read_dir(staging_dir).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ordinals),
        Err(err) => return Err(err),
    };
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_temp_name(&name) {
            continue;
        }
        if let Ok(ordinal) = name.parse::<u64>()
            && entry.file_type().await?.is_file()
        {
            ordinals.insert(ordinal);
        }
    }
    Ok(ordinals)
}

/// 返回 `[0, total_chunks)` 中尚未落盘的分片数量，只按已收到的文件计数。
pub async fn pending_count(staging_dir: &Path, total_chunks: u64) -> io::Result<u64> {
    let received = received_ordinals(staging_dir).await?;
    let present = received.range(..total_chunks).count() as u64;
    Ok(total_chunks - present)
}
