//! 暂存目录清理与空闲锁回收的后台任务。

use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gc::sweep_staging;
use crate::locking::LockManager;
use crate::merge::MergeQueue;
use crate::paths::PathResolver;
use crate::upload::UploadConfig;

/// 启动周期性清理任务，每个间隔执行一轮。
pub fn spawn_background_tasks(
    resolver: Arc<PathResolver>,
    upload: Arc<UploadConfig>,
    queue: MergeQueue,
    locks: Arc<LockManager>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(upload.gc_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match sweep_staging(&resolver, &queue, upload.retention, SystemTime::now()).await {
                Ok(report) => info!(
                    removed_users = report.removed_users,
                    removed_sessions = report.removed_sessions,
                    skipped_in_flight = report.skipped_in_flight,
                    "staging sweep finished"
                ),
                Err(err) => warn!(error = %err, "staging sweep failed"),
            }
            let pruned = locks.prune_idle().await;
            debug!(pruned, "pruned idle path locks");
        }
    });
}
