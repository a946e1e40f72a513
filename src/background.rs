//! 后台维护任务：清理暂存文件与过期的转码状态。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::STAGING_CLEAN_INTERVAL_SECS;
use crate::storage::Storage;
use crate::transcode::TranscodeTracker;

/// 启动后台任务：定期清理中断上传遗留的暂存文件（`ttl` 为零时跳过），
/// 并移除已不存在文件的转码状态。
pub fn spawn_background_tasks(
    storage: Arc<Storage>,
    tracker: Arc<TranscodeTracker>,
    ttl: Duration,
) {
    if ttl.is_zero() {
        debug!("staging cleanup disabled");
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if !ttl.is_zero()
                && let Err(err) = storage.sweep_staging(ttl).await
            {
                warn!(error = %err, "staging cleanup failed");
            }
            let pruned = tracker.prune_missing(storage.root_path()).await;
            if pruned > 0 {
                debug!(pruned, "dropped transcode state of removed files");
            }
        }
    });
}
