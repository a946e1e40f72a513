//! 目录级提交锁：串行化同一目录内的命名与提交。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Returned when a directory lock could not be taken within the wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

/// Asynchronous mutexes keyed by directory.
#[derive(Debug)]
pub struct DirectoryLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl DirectoryLocks {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    /// 获取目录锁，超过等待时间返回 `LockTimeout`。
    pub async fn acquire(&self, dir: &Path) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(self.wait_timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 移除无人持有的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}
