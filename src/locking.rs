//! 内存路径锁：串行化同一上传会话或同一目标路径上的写操作。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

#[derive(Debug, Error)]
#[error("timed out waiting for lock on {0}")]
pub struct LockTimeout(pub PathBuf);

/// Manages asynchronous mutexes keyed by absolute filesystem path.
#[derive(Debug)]
pub struct LockManager {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    /// 在配置的超时时间内获取路径锁。
    pub async fn lock(&self, path: &Path) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(self.wait_timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout(path.to_path_buf()))
    }

    /// 移除无人持有也无人等待的锁，返回清理数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_on_same_path_times_out() {
        let manager = LockManager::new(Duration::from_millis(50));
        let path = Path::new("/srv/storage/tmp/1/a");
        let _held = manager.lock(path).await.expect("first lock");

        let result = manager.lock(path).await;
        assert!(matches!(result, Err(LockTimeout(p)) if p == path));

        manager
            .lock(Path::new("/srv/storage/tmp/1/b"))
            .await
            .expect("other paths are independent");
    }

    #[tokio::test]
    async fn prune_idle_keeps_held_locks() {
        let manager = LockManager::new(Duration::from_millis(50));
        let held = manager.lock(Path::new("/held")).await.expect("lock");
        drop(manager.lock(Path::new("/released")).await.expect("lock"));

        assert_eq!(manager.prune_idle().await, 1);
        drop(held);
        assert_eq!(manager.prune_idle().await, 1);
    }
}
