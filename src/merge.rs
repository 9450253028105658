//! 后台合并：有界队列 + 固定数量的合并 worker。
//!
//! 分片按序号升序拼接到目标文件的同目录临时文件，全部成功后 rename 覆盖目标，
//! 再删除暂存目录。失败只记录日志并写入会话描述，不会反馈给上传请求。

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicFile;
use crate::locking::{LockManager, LockTimeout};
use crate::session::{self, SessionState, chunk_path};

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct MergeJob {
    pub user_id: u64,
    pub file_id: String,
    pub staging_dir: PathBuf,
    pub destination: PathBuf,
    pub total_chunks: u64,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("chunk {0} is missing")]
    MissingChunk(u64),
    #[error(transparent)]
    Locked(#[from] LockTimeout),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MergeError {
    fn is_retryable(&self) -> bool {
        !matches!(self, MergeError::MissingChunk(_))
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("merge queue is full")]
    Full,
    #[error("merge queue is closed")]
    Closed,
}

/// 合并任务的提交端，同时记录正在排队或合并中的暂存目录。
#[derive(Clone, Debug)]
pub struct MergeQueue {
    sender: mpsc::Sender<MergeJob>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MergeQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MergeJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Self {
            sender,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        (queue, receiver)
    }

    /// 非阻塞提交；队列已满时立即返回 `SubmitError::Full`。
    pub async fn submit(&self, job: MergeJob) -> Result<(), SubmitError> {
        let staging_dir = job.staging_dir.clone();
        self.in_flight.lock().await.insert(staging_dir.clone());
        if let Err(err) = self.sender.try_send(job) {
            self.in_flight.lock().await.remove(&staging_dir);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            });
        }
        Ok(())
    }

    pub async fn is_in_flight(&self, staging_dir: &Path) -> bool {
        self.in_flight.lock().await.contains(staging_dir)
    }

    async fn finish(&self, staging_dir: &Path) {
        self.in_flight.lock().await.remove(staging_dir);
    }
}

/// 创建合并队列并启动固定数量的 worker。
pub fn spawn_merge_workers(config: MergeConfig, locks: Arc<LockManager>) -> MergeQueue {
    let (queue, receiver) = MergeQueue::channel(config.queue_capacity);
    let receiver = Arc::new(Mutex::new(receiver));
    let config = Arc::new(config);
    for worker in 0..config.workers.max(1) {
        let receiver = receiver.clone();
        let queue = queue.clone();
        let config = config.clone();
        let locks = locks.clone();
        tokio::spawn(async move {
            loop {
                let job = { receiver.lock().await.recv().await };
                let Some(job) = job else {
                    debug!(worker, "merge queue closed");
                    break;
                };
                let _ = run_job(&job, &config, &locks).await;
                queue.finish(&job.staging_dir).await;
            }
        });
    }
    queue
}

/// 执行一次合并任务（含重试），成功后释放暂存目录，最终失败时标记会话。
pub async fn run_job(
    job: &MergeJob,
    config: &MergeConfig,
    locks: &LockManager,
) -> Result<u64, MergeError> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match merge_chunks(job, locks).await {
            Ok(bytes) => {
                info!(
                    user_id = job.user_id,
                    file_id = job.file_id,
                    destination = ?job.destination,
                    chunks = job.total_chunks,
                    bytes,
                    attempt,
                    "merge complete"
                );
                release_staging(job, locks).await;
                return Ok(bytes);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config.backoff, attempt);
                warn!(
                    user_id = job.user_id,
                    file_id = job.file_id,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "merge attempt failed, retrying"
                );
                time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    user_id = job.user_id,
                    file_id = job.file_id,
                    destination = ?job.destination,
                    error = %err,
                    attempt,
                    "merge failed"
                );
                mark_failed(job, locks, attempt, &err).await;
                return Err(err);
            }
        }
    }
}

/// 按序号升序拼接全部分片，返回写入的总字节数。
pub async fn merge_chunks(job: &MergeJob, locks: &LockManager) -> Result<u64, MergeError> {
    for ordinal in 0..job.total_chunks {
        if !fs::try_exists(chunk_path(&job.staging_dir, ordinal)).await? {
            return Err(MergeError::MissingChunk(ordinal));
        }
    }

    if let Some(parent) = job.destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    let _guard = locks.lock(&job.destination).await?;

    let mut atomic = AtomicFile::new(&job.destination).await?;
    let write_result: Result<u64, MergeError> = async {
        let mut total_written: u64 = 0;
        for ordinal in 0..job.total_chunks {
            let mut part = match File::open(chunk_path(&job.staging_dir, ordinal)).await {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(MergeError::MissingChunk(ordinal));
                }
                Err(err) => return Err(err.into()),
            };
            total_written += tokio::io::copy(&mut part, atomic.file_mut()).await?;
        }
        Ok(total_written)
    }
    .await;

    match write_result {
        Ok(total_written) => {
            atomic.finalize().await?;
            Ok(total_written)
        }
        Err(err) => {
            atomic.cleanup().await;
            Err(err)
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

async fn release_staging(job: &MergeJob, locks: &LockManager) {
    let _guard = locks.lock(&job.staging_dir).await.ok();
    if let Err(err) = fs::remove_dir_all(&job.staging_dir).await {
        warn!(
            path = ?job.staging_dir,
            error = %err,
            "failed to remove staging dir after merge"
        );
    }
}

async fn mark_failed(job: &MergeJob, locks: &LockManager, attempts: u32, err: &MergeError) {
    let _guard = locks.lock(&job.staging_dir).await.ok();
    match session::load(&job.staging_dir).await {
        Ok(Some(mut descriptor)) => {
            descriptor.state = SessionState::Failed;
            descriptor.attempts = attempts;
            descriptor.last_error = Some(err.to_string());
            if let Err(store_err) = session::store(&job.staging_dir, &descriptor).await {
                warn!(path = ?job.staging_dir, error = %store_err, "failed to record merge failure");
            }
        }
        Ok(None) => {
            warn!(path = ?job.staging_dir, "session descriptor missing after merge failure");
        }
        Err(load_err) => {
            warn!(path = ?job.staging_dir, error = %load_err, "failed to read session descriptor");
        }
    }
}
