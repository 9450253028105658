//! 暂存目录垃圾回收：两级检查 `tmp/<user_id>/<file_id>` 的修改时间。
//!
//! 用户目录的 mtime 只在其中增删会话时变化，持续写入分片的会话不会刷新它，
//! 因此总是逐会话检查；过期的用户目录只有在清空后才会删除。
//! 只扫描 `tmp/`，从不触碰 `data/`。

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::merge::MergeQueue;
use crate::paths::PathResolver;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_users: usize,
    pub removed_sessions: usize,
    pub skipped_in_flight: usize,
}

/// 执行一轮清理；`now` 由调用方提供以便测试。
pub async fn sweep_staging(
    resolver: &PathResolver,
    queue: &MergeQueue,
    retention: Duration,
    now: SystemTime,
) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let staging_root = resolver.staging_root();
    let mut users = fs::read_dir(&staging_root).await?;

    while let Some(user_entry) = users.next_entry().await? {
        let user_dir = user_entry.path();
        let metadata = match fs::metadata(&user_dir).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = ?user_dir, error = %err, "stat staging dir failed");
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }

        let user_stale = is_stale(&metadata, now, retention);
        sweep_sessions(&user_dir, queue, retention, now, &mut report).await;
        if user_stale && remove_empty_dir(&user_dir).await {
            report.removed_users += 1;
        }
    }

    Ok(report)
}

async fn sweep_sessions(
    user_dir: &Path,
    queue: &MergeQueue,
    retention: Duration,
    now: SystemTime,
    report: &mut SweepReport,
) {
    let mut sessions = match fs::read_dir(user_dir).await {
        Ok(sessions) => sessions,
        Err(err) => {
            warn!(path = ?user_dir, error = %err, "read staging subdir failed");
            return;
        }
    };
    loop {
        let session_entry = match sessions.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(path = ?user_dir, error = %err, "read staging subdir failed");
                break;
            }
        };
        let session_dir = session_entry.path();
        let metadata = match fs::metadata(&session_dir).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = ?session_dir, error = %err, "stat staging dir failed");
                continue;
            }
        };
        if !metadata.is_dir() || !is_stale(&metadata, now, retention) {
            continue;
        }
        if queue.is_in_flight(&session_dir).await {
            report.skipped_in_flight += 1;
            continue;
        }
        if remove_dir(&session_dir).await {
            report.removed_sessions += 1;
        }
    }
}

fn is_stale(metadata: &std::fs::Metadata, now: SystemTime, retention: Duration) -> bool {
    metadata
        .modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > retention)
}

async fn remove_dir(path: &Path) -> bool {
    match fs::remove_dir_all(path).await {
        Ok(()) => {
            info!(path = ?path, "removed stale staging dir");
            true
        }
        Err(err) => {
            warn!(path = ?path, error = %err, "failed to remove stale staging dir");
            false
        }
    }
}

/// 非递归删除；目录非空（例如刚有新会话创建）时保留。
async fn remove_empty_dir(path: &Path) -> bool {
    match fs::remove_dir(path).await {
        Ok(()) => {
            info!(path = ?path, "removed empty staging dir");
            true
        }
        Err(err) => {
            debug!(path = ?path, error = %err, "staging dir kept");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, Role};
    use crate::merge::MergeJob;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn make_resolver() -> (tempfile::TempDir, PathResolver) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, PathResolver::new(root))
    }

    fn stage(resolver: &PathResolver, identity: &Identity, file_id: &str) -> std::path::PathBuf {
        let dir = resolver.resolve_staging(file_id, identity).expect("staging");
        std::fs::create_dir_all(&dir).expect("create staging");
        std::fs::write(dir.join("0"), b"chunk").expect("chunk");
        dir
    }

    #[tokio::test]
    async fn stale_staging_is_removed_and_data_untouched() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(1);
        let alice = Identity::new(1, "alice", Role::User);
        let session = stage(&resolver, &alice, "old");
        let durable = resolver.resolve("kept.txt", &alice).expect("resolve");
        std::fs::create_dir_all(durable.parent().expect("parent")).expect("data dir");
        std::fs::write(&durable, b"keep").expect("durable file");

        let later = SystemTime::now() + 2 * HOUR;
        let report = sweep_staging(&resolver, &queue, HOUR, later)
            .await
            .expect("sweep");

        assert_eq!(report.removed_sessions, 1);
        assert_eq!(report.removed_users, 1);
        assert!(!session.exists());
        assert_eq!(std::fs::read(&durable).expect("durable survives"), b"keep");
    }

    #[tokio::test]
    async fn fresh_staging_survives() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(1);
        let alice = Identity::new(1, "alice", Role::User);
        let session = stage(&resolver, &alice, "fresh");

        let report = sweep_staging(&resolver, &queue, HOUR, SystemTime::now())
            .await
            .expect("sweep");

        assert_eq!(report, SweepReport::default());
        assert!(session.join("0").exists());
    }

    #[tokio::test]
    async fn missing_staging_root_is_an_error() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(1);
        let result = sweep_staging(&resolver, &queue, HOUR, SystemTime::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn in_flight_merges_are_not_reaped() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(4);
        let alice = Identity::new(1, "alice", Role::User);
        let merging = stage(&resolver, &alice, "merging");
        let abandoned = stage(&resolver, &alice, "abandoned");
        queue
            .submit(MergeJob {
                user_id: 1,
                file_id: "merging".into(),
                staging_dir: merging.clone(),
                destination: resolver.resolve("m.bin", &alice).expect("resolve"),
                total_chunks: 1,
            })
            .await
            .expect("submit");

        let later = SystemTime::now() + 2 * HOUR;
        let report = sweep_staging(&resolver, &queue, HOUR, later)
            .await
            .expect("sweep");

        assert_eq!(
            report,
            SweepReport {
                removed_users: 0,
                removed_sessions: 1,
                skipped_in_flight: 1,
            }
        );
        assert!(merging.exists());
        assert!(!abandoned.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_user_dir_keeps_sessions_written_within_window() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(1);
        let alice = Identity::new(1, "alice", Role::User);
        let stale = stage(&resolver, &alice, "stale");
        let live = stage(&resolver, &alice, "live");

        let past = SystemTime::now() - 3 * HOUR;
        std::fs::File::open(&stale)
            .and_then(|dir| dir.set_modified(past))
            .expect("age stale session");
        let user_dir = resolver.user_staging_root(&alice);
        std::fs::File::open(&user_dir)
            .and_then(|dir| dir.set_modified(past))
            .expect("age user dir");

        let report = sweep_staging(&resolver, &queue, HOUR, SystemTime::now())
            .await
            .expect("sweep");
        assert_eq!(
            report,
            SweepReport {
                removed_users: 0,
                removed_sessions: 1,
                skipped_in_flight: 0,
            }
        );
        assert!(!stale.exists());
        assert!(live.join("0").exists(), "live session must survive");
        assert!(user_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_user_dir_is_removed_once_empty() {
        let (_temp, resolver) = make_resolver();
        let (queue, _jobs) = MergeQueue::channel(1);
        let alice = Identity::new(1, "alice", Role::User);
        let abandoned = stage(&resolver, &alice, "abandoned");

        let past = SystemTime::now() - 3 * HOUR;
        std::fs::File::open(&abandoned)
            .and_then(|dir| dir.set_modified(past))
            .expect("age session");
        let user_dir = resolver.user_staging_root(&alice);
        std::fs::File::open(&user_dir)
            .and_then(|dir| dir.set_modified(past))
            .expect("age user dir");

        let report = sweep_staging(&resolver, &queue, HOUR, SystemTime::now())
            .await
            .expect("sweep");
        assert_eq!(report.removed_sessions, 1);
        assert_eq!(report.removed_users, 1);
        assert!(!user_dir.exists());
    }
}
